use crate::Trunk;
use core::{
    cmp::Ordering,
    fmt::{Display, Formatter},
};

/// Urgency of a task. Higher urgency is served first.
#[derive(strum::Display, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Debug)]
pub enum Priority {
    /// Session setup and trunk rescans.
    High,
    /// Sensor address queries.
    Medium,
    /// Temperature queries.
    Low,
    /// Keep-alive pings.
    UltraLow,
}

/// Work to be done by a [`Manager`](super::Manager).
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub enum TaskAction {
    /// Starts a new session and schedules a rescan of every trunk.
    Bootstrap,
    /// Counts the sensors on a trunk.
    Rescan(Trunk),
    /// Reads the sensor addresses of a trunk.
    QueryAddresses(Trunk),
    /// Reads the sensor temperatures of a trunk.
    QueryTemperatures(Trunk),
    /// Checks that the controller is still alive.
    Ping,
}

impl TaskAction {
    /// Returns the trunk the action applies to.
    #[must_use]
    pub fn trunk(self) -> Option<Trunk> {
        match self {
            Self::Rescan(trunk) | Self::QueryAddresses(trunk) | Self::QueryTemperatures(trunk) => {
                Some(trunk)
            }
            Self::Bootstrap | Self::Ping => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Bootstrap => 0,
            Self::Rescan(_) => 1,
            Self::QueryAddresses(_) => 2,
            Self::QueryTemperatures(_) => 3,
            Self::Ping => 4,
        }
    }
}

/// Prioritized unit of work.
///
/// Tasks are ordered by priority, then by trunk number,
/// with trunk-less tasks coming first.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub struct Task {
    /// Urgency of the task.
    pub priority: Priority,
    /// Work to be done.
    pub action: TaskAction,
}

impl Task {
    /// Constructs a task.
    #[must_use]
    pub const fn new(priority: Priority, action: TaskAction) -> Self {
        Self { priority, action }
    }

    fn key(self) -> (Priority, u8, u8) {
        let tie_break = self.action.trunk().map_or(0, Trunk::number);

        (self.priority, tie_break, self.action.rank())
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for TaskAction {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::Rescan(trunk) => write!(f, "rescan of trunk {trunk}"),
            Self::QueryAddresses(trunk) => write!(f, "addresses of trunk {trunk}"),
            Self::QueryTemperatures(trunk) => write!(f, "temperatures of trunk {trunk}"),
            Self::Ping => write!(f, "ping"),
        }
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        write!(f, "{} ({})", self.action, self.priority)
    }
}
