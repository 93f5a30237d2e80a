use tokio_postgres::types::PgLsn;

/// Position of a committed change in the source's write-ahead log.
///
/// Totally ordered and otherwise opaque to everything downstream of the
/// listener: sinks and checkpoint stores only ever compare and persist it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitPosition(u64);

impl CommitPosition {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<PgLsn> for CommitPosition {
    fn from(lsn: PgLsn) -> Self {
        Self(lsn.into())
    }
}

impl From<CommitPosition> for PgLsn {
    fn from(pos: CommitPosition) -> Self {
        pos.0.into()
    }
}

impl From<u64> for CommitPosition {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for CommitPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_totally_ordered() {
        assert!(CommitPosition::new(1) < CommitPosition::new(2));
        assert_eq!(CommitPosition::new(7), CommitPosition::from(7u64));
    }

    #[test]
    fn displays_as_an_lsn() {
        assert_eq!(CommitPosition::new(0x1_0000_002A).to_string(), "1/2A");
    }
}
