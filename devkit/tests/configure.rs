use paper_core::config::InputSource;
use paper_core::device::{reg, CORE_ARP_OFFSET, CORE_IP_OFFSET, CORE_MAC_OFFSET};
use paper_core::fengine::{configure, ConfigureError, EQ_BLOCKS};
use paper_core::store::SYNC_TIME_KEY;
use paper_core::topology::AddressPlan;
use paper_core::BarrierError;
use paper_devkit::{MockStore, TestHarness};
use std::net::Ipv4Addr;

#[tokio::test]
async fn configures_every_engine_in_step_order() {
    let mut h = TestHarness::new(2);
    let opts = h.options();
    let devices = h.take_devices();

    let report = configure(devices, Some(&h.store), &h.resolver, &h.clock, &opts).await.unwrap();

    assert_eq!(report.configured, vec![("pf1".to_string(), 0), ("pf2".to_string(), 1)]);
    assert!(report.excluded.is_empty());
    assert_eq!(report.sync_time, Some(1_700_000_001));
    assert_eq!(h.store.get(SYNC_TIME_KEY), Some("1700000001".into()));

    // every device finishes a step before any device starts the next
    let last_fid = h.journal.rposition(|op| op.name() == reg::FID).unwrap();
    let first_shift = h.journal.position(|op| op.name() == reg::FFT_SHIFT).unwrap();
    assert!(last_fid < first_shift);
    let last_ctmode = h.journal.rposition(|op| op.name() == reg::CTMODE).unwrap();
    let first_arm = h.journal.position(|op| op.name() == reg::SYNC_ARM).unwrap();
    assert!(last_ctmode < first_arm);

    // transmit is off first, X engine path back on before the switch path
    let names = h.journal.names_for("pf1");
    assert_eq!(&names[..2], &[reg::ETH_SW_EN, reg::ETH_GPU_EN]);
    assert_eq!(&names[names.len() - 2..], &[reg::ETH_GPU_EN, reg::ETH_SW_EN]);
    assert_eq!(h.journal.writes_to(reg::ETH_SW_EN).last(), Some(&("pf2".to_string(), 1)));

    assert_eq!(h.journal.writes_to(reg::FID), vec![("pf1".to_string(), 0), ("pf2".to_string(), 1)]);
    assert_eq!(h.journal.writes_to(reg::FFT_SHIFT)[0].1, 2047);
    assert_eq!(h.journal.writes_to(reg::INSEL[0])[0].1, InputSource::Adc.register_value());

    let resets: Vec<u32> = h.journal.writes_to(reg::ETH_GPU_RST).iter().map(|(_, v)| *v).collect();
    assert_eq!(resets, vec![0, 1, 0, 0, 1, 0]);
}

#[tokio::test]
async fn pushes_derived_addresses_and_arp() {
    let mut h = TestHarness::new(4);
    let mut opts = h.options();
    opts.sync = false;
    let devices = h.take_devices();

    configure(devices, None::<&MockStore>, &h.resolver, &h.clock, &opts).await.unwrap();

    let plan = AddressPlan::default();
    let id = plan.derive_identity(3, 2);
    let ip = h.journal.block("pf4", "eth_2_gpu", CORE_IP_OFFSET).unwrap();
    assert_eq!(ip, u32::from(id.cluster.ip).to_be_bytes().to_vec());
    assert_eq!(id.cluster.ip, Ipv4Addr::new(10, 10, 4, 4));

    let mac = h.journal.block("pf4", "eth_2_sw", CORE_MAC_OFFSET).unwrap();
    assert_eq!(&mac[2..], &id.switch.mac.to_u64().to_be_bytes()[2..]);

    let arp = h.journal.block("pf1", "eth_0_sw", CORE_ARP_OFFSET).unwrap();
    assert_eq!(arp, plan.switch_arp_table().to_bytes());
    assert_eq!(arp, h.journal.block("pf4", "eth_3_sw", CORE_ARP_OFFSET).unwrap());
    assert!(h.journal.block("pf1", "eth_0_gpu", CORE_ARP_OFFSET).is_none());

    // px4-4 resolves to 10.0.3.2 in the harness
    let xip = h.journal.writes_to("eth_2_xip");
    assert_eq!(xip[3], ("pf4".to_string(), u32::from(Ipv4Addr::new(10, 0, 3, 2))));

    let eq = h.journal.block("pf2", "eq_15_coeffs", 0).unwrap();
    assert_eq!(eq.len(), 2048 * 4);
    assert_eq!(&eq[..4], &76_800u32.to_be_bytes());
    assert_eq!(h.journal.names_for("pf2").iter().filter(|n| n.starts_with("eq_")).count(), EQ_BLOCKS as usize);

    assert!(h.journal.writes_to(reg::SYNC_ARM).is_empty());
    assert!(h.journal.writes_to(reg::NOISE_ARM).is_empty());
}

#[tokio::test]
async fn design_mismatch_excludes_one_engine() {
    let mut h = TestHarness::new(3);
    h.replace(1, |dev| dev.with_features(&["adc_snap", "sync_count"]));
    let opts = h.options();
    let devices = h.take_devices();

    let report = configure(devices, Some(&h.store), &h.resolver, &h.clock, &opts).await.unwrap();

    assert_eq!(report.excluded.len(), 1);
    assert_eq!(report.excluded[0].host, "pf2");
    assert_eq!(report.excluded[0].step, "preflight");
    assert_eq!(report.configured, vec![("pf1".to_string(), 0), ("pf3".to_string(), 2)]);

    assert!(h.journal.names_for("pf2").is_empty());
    let enables: Vec<String> = h.journal.writes_to(reg::ETH_SW_EN).into_iter().filter(|(_, v)| *v == 1).map(|(h, _)| h).collect();
    assert_eq!(enables, vec!["pf1", "pf3"]);
}

#[tokio::test]
async fn unreachable_and_unprogrammed_are_reported() {
    let mut h = TestHarness::new(3);
    h.disconnect(0);
    h.replace(2, |dev| dev.unprogrammed());
    let opts = h.options();
    let devices = h.take_devices();

    let report = configure(devices, Some(&h.store), &h.resolver, &h.clock, &opts).await.unwrap();

    assert_eq!(report.configured, vec![("pf2".to_string(), 1)]);
    let hosts: Vec<&str> = report.excluded.iter().map(|e| e.host.as_str()).collect();
    assert_eq!(hosts, vec!["pf1", "pf3"]);
    assert!(report.excluded[1].reason.contains("not programmed"));
}

#[tokio::test]
async fn unresolvable_peer_drops_only_that_engine() {
    let mut h = TestHarness::new(2);
    h.resolver.remove("px2-3");
    let opts = h.options();
    let devices = h.take_devices();

    let report = configure(devices, Some(&h.store), &h.resolver, &h.clock, &opts).await.unwrap();

    assert_eq!(report.configured, vec![("pf1".to_string(), 0)]);
    assert_eq!(report.excluded[0].host, "pf2");
    assert_eq!(report.excluded[0].step, "10 GbE");
    assert!(h.journal.writes_to(reg::CTMODE).iter().all(|(host, _)| host == "pf1"));
    assert!(h.journal.writes_to(reg::SYNC_ARM).iter().all(|(host, _)| host == "pf1"));
}

#[tokio::test]
async fn barrier_timeout_aborts_run() {
    let mut h = TestHarness::new(2);
    h.replace(0, |dev| dev.with_edge_every(None));
    let opts = h.options();
    let devices = h.take_devices();

    let err = configure(devices, Some(&h.store), &h.resolver, &h.clock, &opts).await.unwrap_err();

    assert!(matches!(err, ConfigureError::Barrier(BarrierError::Timeout { .. })));
    assert!(h.journal.writes_to(reg::ETH_GPU_EN).iter().all(|(_, v)| *v == 0));
    assert_eq!(h.store.get(SYNC_TIME_KEY), None);
}

#[tokio::test]
async fn sync_without_store_is_rejected() {
    let mut h = TestHarness::new(1);
    let opts = h.options();
    let devices = h.take_devices();

    let err = configure(devices, None::<&MockStore>, &h.resolver, &h.clock, &opts).await.unwrap_err();
    assert!(matches!(err, ConfigureError::MissingStore));
    assert!(h.journal.ops().is_empty());
}

#[tokio::test]
async fn zero_repetitions_rejected_before_any_write() {
    let mut h = TestHarness::new(2);
    let mut opts = h.options();
    opts.barrier.repetitions = 0;
    let devices = h.take_devices();

    let err = configure(devices, Some(&h.store), &h.resolver, &h.clock, &opts).await.unwrap_err();
    assert!(matches!(err, ConfigureError::Barrier(BarrierError::NoRepetitions)));
    assert!(h.journal.ops().is_empty());
    assert_eq!(h.store.get(SYNC_TIME_KEY), None);
}

#[tokio::test]
async fn noise_input_selection() {
    let mut h = TestHarness::new(1);
    let mut opts = h.options();
    opts.input = InputSource::Noise;
    let devices = h.take_devices();

    configure(devices, Some(&h.store), &h.resolver, &h.clock, &opts).await.unwrap();

    for register in reg::INSEL {
        assert_eq!(h.journal.writes_to(register), vec![("pf1".to_string(), 0x5555_5555)]);
    }
    assert_eq!(h.journal.writes_to(reg::NOISE_ARM).len(), 2);
}
