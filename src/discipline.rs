//! Rank discipline selector and per-discipline helpers.

use crate::error::MalformedInput;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

/// Rank computation selected for a packet.
///
/// Each discipline owns its own slice of the scheduling state: strict priority is stateless,
/// DRR reads/writes the service counters and the dequeue cycle, WFQ reads/writes the finish
/// times and the virtual time. Disciplines never touch each other's global scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Discipline {
    #[serde(rename = "sp")]
    StrictPriority,
    #[serde(rename = "drr")]
    DeficitRoundRobin,
    #[serde(rename = "wfq")]
    WeightedFairQueueing,
}

impl Discipline {
    /// All disciplines in tag order.
    pub const ALL: [Discipline; 3] = [
        Discipline::StrictPriority,
        Discipline::DeficitRoundRobin,
        Discipline::WeightedFairQueueing,
    ];

    /// Stable index for discipline based arrays.
    pub const fn index(self) -> usize {
        match self {
            Discipline::StrictPriority => 0,
            Discipline::DeficitRoundRobin => 1,
            Discipline::WeightedFairQueueing => 2,
        }
    }

    /// Wire tag carried by inbound packets that select their own discipline.
    pub const fn tag(self) -> u8 {
        self.index() as u8
    }

    /// Decode a wire tag. Anything outside {0, 1, 2} is malformed input.
    pub fn from_tag(tag: u8) -> Result<Discipline, MalformedInput> {
        match tag {
            0 => Ok(Discipline::StrictPriority),
            1 => Ok(Discipline::DeficitRoundRobin),
            2 => Ok(Discipline::WeightedFairQueueing),
            other => Err(MalformedInput::UnknownDiscipline(other)),
        }
    }

    /// Short lowercase name used in configuration files and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Discipline::StrictPriority => "sp",
            Discipline::DeficitRoundRobin => "drr",
            Discipline::WeightedFairQueueing => "wfq",
        }
    }
}

impl Default for Discipline {
    fn default() -> Self {
        Discipline::DeficitRoundRobin
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Discipline {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sp" | "strict" | "strict-priority" => Ok(Discipline::StrictPriority),
            "drr" | "deficit-round-robin" => Ok(Discipline::DeficitRoundRobin),
            "wfq" | "weighted-fair-queueing" => Ok(Discipline::WeightedFairQueueing),
            other => Err(format!("unknown discipline '{other}' (expected sp, drr or wfq)")),
        }
    }
}

/// One value per [`Discipline`], indexed in O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisciplineTable<T> {
    values: Vec<T>,
}

impl<T> DisciplineTable<T> {
    /// Build a table by calling `f` once per discipline in [`Discipline::ALL`] order.
    pub fn from_fn(mut f: impl FnMut(Discipline) -> T) -> Self {
        let mut values = Vec::with_capacity(Discipline::ALL.len());
        for discipline in Discipline::ALL {
            values.push(f(discipline));
        }
        DisciplineTable { values }
    }

    pub fn get(&self, discipline: Discipline) -> &T {
        &self.values[discipline.index()]
    }

    pub fn get_mut(&mut self, discipline: Discipline) -> &mut T {
        &mut self.values[discipline.index()]
    }
}

impl<T> Index<Discipline> for DisciplineTable<T> {
    type Output = T;

    fn index(&self, index: Discipline) -> &Self::Output {
        self.get(index)
    }
}

impl<T> IndexMut<Discipline> for DisciplineTable<T> {
    fn index_mut(&mut self, index: Discipline) -> &mut Self::Output {
        self.get_mut(index)
    }
}
