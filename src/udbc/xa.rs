use crate::error::XaError;
use serde::Serialize;
use std::fmt;

/// X/Open transaction branch identifier.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch.into(),
        }
    }
}

fn hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.format_id)?;
        hex(f, &self.global_id)?;
        write!(f, "-")?;
        hex(f, &self.branch_qualifier)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({})", self)
    }
}

/// start/end/recover 标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct XaFlags(pub u32);

impl XaFlags {
    pub const NO_FLAGS: XaFlags = XaFlags(0);
    pub const JOIN: XaFlags = XaFlags(0x0020_0000);
    pub const END_RSCAN: XaFlags = XaFlags(0x0080_0000);
    pub const START_RSCAN: XaFlags = XaFlags(0x0100_0000);
    pub const SUSPEND: XaFlags = XaFlags(0x0200_0000);
    pub const SUCCESS: XaFlags = XaFlags(0x0400_0000);
    pub const RESUME: XaFlags = XaFlags(0x0800_0000);
    pub const FAIL: XaFlags = XaFlags(0x2000_0000);
    pub const ONE_PHASE: XaFlags = XaFlags(0x4000_0000);

    pub fn contains(self, other: XaFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for XaFlags {
    type Output = XaFlags;

    fn bitor(self, rhs: XaFlags) -> XaFlags {
        XaFlags(self.0 | rhs.0)
    }
}

/// prepare 阶段的投票结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum XaVote {
    Ok,
    ReadOnly,
}

/// Two-phase-commit participation of one resource manager connection.
///
/// Drivers supply an implementation for each physical connection; the pooled
/// connection's coordinator implements the same trait on top of it.
pub trait XaResource: Send + Sync {
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError>;

    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError>;

    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    fn rollback(&self, xid: &Xid) -> Result<(), XaError>;

    fn forget(&self, xid: &Xid) -> Result<(), XaError>;

    fn recover(&self, flags: XaFlags) -> Result<Vec<Xid>, XaError>;

    fn resource_manager_id(&self) -> String;

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.resource_manager_id() == other.resource_manager_id()
    }

    fn transaction_timeout(&self) -> Result<u32, XaError>;

    fn set_transaction_timeout(&self, secs: u32) -> Result<bool, XaError>;
}
