//! BIP9 version-bits deployment schedule.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum DeploymentPos {
    TestDummy = 0,
    Csv = 1,
}

pub const MAX_VERSION_BITS_DEPLOYMENTS: usize = 2;

pub const ALL_DEPLOYMENTS: [DeploymentPos; MAX_VERSION_BITS_DEPLOYMENTS] =
    [DeploymentPos::TestDummy, DeploymentPos::Csv];

impl DeploymentPos {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            DeploymentPos::TestDummy => "testdummy",
            DeploymentPos::Csv => "csv",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deployment {
    /// Bit position in the block version.
    pub bit: u8,
    /// Median time past at which signalling may begin.
    pub start_time: i64,
    /// Median time past after which an unactivated deployment fails.
    pub timeout: i64,
}

impl Deployment {
    pub const fn mask(&self) -> i32 {
        1i32 << self.bit
    }
}
