/*!
Mock F engine boards

Each `MockDevice` owns its registers but appends every write to a shared
`Journal`, so tests can check ordering across boards. `sync_count` advances
by one every `edge_every` reads, standing in for the 1 PPS counter.
*/

use paper_core::device::{reg, Device, DeviceError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Write { host: String, name: String, value: u32 },
    Block { host: String, name: String, offset: u32, data: Vec<u8> },
}

impl Op {
    pub fn host(&self) -> &str {
        match self {
            Op::Write { host, .. } | Op::Block { host, .. } => host,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Op::Write { name, .. } | Op::Block { name, .. } => name,
        }
    }
}

#[derive(Clone, Default)]
pub struct Journal {
    ops: Arc<Mutex<Vec<Op>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, op: Op) {
        self.ops.lock().push(op);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    /// `(host, value)` of every write to `register`, in order.
    pub fn writes_to(&self, register: &str) -> Vec<(String, u32)> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                Op::Write { host, name, value } if name == register => Some((host.clone(), *value)),
                _ => None,
            })
            .collect()
    }

    pub fn block(&self, host: &str, name: &str, offset: u32) -> Option<Vec<u8>> {
        self.ops.lock().iter().rev().find_map(|op| match op {
            Op::Block { host: h, name: n, offset: o, data } if h == host && n == name && *o == offset => {
                Some(data.clone())
            }
            _ => None,
        })
    }

    /// Registers and blocks touched by `host`, in order.
    pub fn names_for(&self, host: &str) -> Vec<String> {
        self.ops.lock().iter().filter(|op| op.host() == host).map(|op| op.name().to_string()).collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.ops.lock().iter().map(|op| op.host().to_string()).collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Position of the first op matching `pred`.
    pub fn position(&self, pred: impl Fn(&Op) -> bool) -> Option<usize> {
        self.ops.lock().iter().position(pred)
    }

    pub fn rposition(&self, pred: impl Fn(&Op) -> bool) -> Option<usize> {
        self.ops.lock().iter().rposition(pred)
    }
}

pub struct MockDevice {
    host: String,
    journal: Journal,
    registers: HashMap<String, u32>,
    programmed: bool,
    features: Vec<String>,
    edge_every: Option<u32>,
    sync_reads: u32,
    fail_on: Option<String>,
}

impl MockDevice {
    /// A programmed board running the F engine design.
    pub fn new(host: impl Into<String>, journal: &Journal) -> Self {
        Self {
            host: host.into(),
            journal: journal.clone(),
            registers: HashMap::new(),
            programmed: true,
            features: vec![reg::DESIGN_MARKER.to_string(), reg::SYNC_COUNT.to_string()],
            edge_every: Some(3),
            sync_reads: 0,
            fail_on: None,
        }
    }

    pub fn unprogrammed(mut self) -> Self {
        self.programmed = false;
        self
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features = features.iter().map(|f| f.to_string()).collect();
        self
    }

    /// `None` freezes `sync_count`.
    pub fn with_edge_every(mut self, reads: Option<u32>) -> Self {
        self.edge_every = reads;
        self
    }

    /// Accesses to `name` fail as if the board dropped off the network.
    pub fn failing_on(mut self, name: &str) -> Self {
        self.fail_on = Some(name.to_string());
        self
    }

    pub fn register(&self, name: &str) -> Option<u32> {
        self.registers.get(name).copied()
    }

    fn check(&self, name: &str) -> Result<(), DeviceError> {
        if self.fail_on.as_deref() == Some(name) {
            return Err(DeviceError::Unreachable { host: self.host.clone(), reason: format!("lost while accessing {name}") });
        }
        Ok(())
    }
}

impl Device for MockDevice {
    fn host(&self) -> &str {
        &self.host
    }

    async fn is_programmed(&mut self) -> Result<bool, DeviceError> {
        Ok(self.programmed)
    }

    async fn list_features(&mut self) -> Result<Vec<String>, DeviceError> {
        Ok(self.features.clone())
    }

    async fn read_register(&mut self, name: &str) -> Result<u32, DeviceError> {
        self.check(name)?;
        if name == reg::SYNC_COUNT {
            self.sync_reads += 1;
            if let Some(every) = self.edge_every {
                if self.sync_reads % every == 0 {
                    *self.registers.entry(name.to_string()).or_default() += 1;
                }
            }
        }
        Ok(self.registers.get(name).copied().unwrap_or(0))
    }

    async fn write_register(&mut self, name: &str, value: u32) -> Result<(), DeviceError> {
        self.check(name)?;
        self.registers.insert(name.to_string(), value);
        self.journal.push(Op::Write { host: self.host.clone(), name: name.to_string(), value });
        Ok(())
    }

    async fn write_block(&mut self, name: &str, offset: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.check(name)?;
        self.journal.push(Op::Block { host: self.host.clone(), name: name.to_string(), offset, data: data.to_vec() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_count_ticks() {
        let journal = Journal::new();
        let mut dev = MockDevice::new("pf1", &journal).with_edge_every(Some(2));
        assert_eq!(dev.read_register(reg::SYNC_COUNT).await.unwrap(), 0);
        assert_eq!(dev.read_register(reg::SYNC_COUNT).await.unwrap(), 1);
        assert_eq!(dev.read_register(reg::SYNC_COUNT).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_journal_records_writes() {
        let journal = Journal::new();
        let mut a = MockDevice::new("pf1", &journal);
        let mut b = MockDevice::new("pf2", &journal).failing_on("fid");
        a.write_register("fid", 0).await.unwrap();
        assert!(b.write_register("fid", 1).await.is_err());
        b.write_block("eq_0_coeffs", 0, &[1, 2]).await.unwrap();

        assert_eq!(journal.writes_to("fid"), vec![("pf1".to_string(), 0)]);
        assert_eq!(journal.block("pf2", "eq_0_coeffs", 0), Some(vec![1, 2]));
        assert_eq!(journal.hosts(), vec!["pf1", "pf2"]);
        assert_eq!(a.register("fid"), Some(0));
    }
}
