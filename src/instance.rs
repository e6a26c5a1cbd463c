//! Script Instance (spec §3 "Script Instance"): identity + monotonic
//! checkpoint generation. Lives from script start to end; the checkpoint
//! counter survives across restores.

use std::cell::Cell;

use uuid::Uuid;

/// A 128-bit script instance identifier, written on the wire as two
/// big-endian-ordered `i64`s, most-significant first (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptInstanceId(pub Uuid);

impl ScriptInstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn to_wire_longs(self) -> (i64, i64) {
        let bytes = self.0.as_bytes();
        let hi = i64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let lo = i64::from_be_bytes(bytes[8..16].try_into().unwrap());
        (hi, lo)
    }

    pub fn from_wire_longs(hi: i64, lo: i64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..16].copy_from_slice(&lo.to_be_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for ScriptInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ScriptInstance {
    pub instance_id: ScriptInstanceId,
    checkpoint_id: Cell<u64>,
}

impl ScriptInstance {
    pub fn new() -> Self {
        Self {
            instance_id: ScriptInstanceId::new(),
            checkpoint_id: Cell::new(0),
        }
    }

    /// Restores an instance that already has a checkpoint history — the
    /// counter must survive across restores (spec §3 "Lifecycle").
    pub fn restored(instance_id: ScriptInstanceId, checkpoint_id: u64) -> Self {
        Self {
            instance_id,
            checkpoint_id: Cell::new(checkpoint_id),
        }
    }

    pub fn checkpoint_id(&self) -> u64 {
        self.checkpoint_id.get()
    }

    /// Increments the counter before each checkpoint (spec §4.4 "Checkpoint
    /// path") and returns the new value.
    pub fn next_checkpoint_id(&self) -> u64 {
        let next = self.checkpoint_id.get() + 1;
        self.checkpoint_id.set(next);
        next
    }
}

impl Default for ScriptInstance {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_longs_round_trip() {
        let id = ScriptInstanceId::new();
        let (hi, lo) = id.to_wire_longs();
        let back = ScriptInstanceId::from_wire_longs(hi, lo);
        assert_eq!(id, back);
    }

    #[test]
    fn checkpoint_counter_is_monotonic_and_survives_restore() {
        let inst = ScriptInstance::new();
        assert_eq!(inst.next_checkpoint_id(), 1);
        assert_eq!(inst.next_checkpoint_id(), 2);
        let restored = ScriptInstance::restored(inst.instance_id, inst.checkpoint_id());
        assert_eq!(restored.next_checkpoint_id(), 3);
    }
}
