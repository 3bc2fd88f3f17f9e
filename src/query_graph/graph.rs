use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::types::execution::ValidationVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    MapIntent,
    BuildSpec,
    Decompose,
    Execute,
    Validate,
    Refine,
    Fallback,
    Accept,
    Narrate,
    Done,
}

/// Outcome of the work done in a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TableResolved,
    NoTable,
    SpecBuilt {
        decompose: bool,
    },
    /// Sub-queries ran; `any_accepted` tells whether any produced data.
    Decomposed {
        any_accepted: bool,
    },
    NotDecomposable,
    Executed,
    Validated {
        verdict: ValidationVerdict,
        attempt: u32,
        max_retries: u32,
    },
    Refined,
    Proceed,
    Narrated,
}

/// Resolution policy.
///
/// `Linear` is `Adaptive` without decomposition and with no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Linear,
    Adaptive,
}

impl Policy {
    pub fn max_retries(self, configured: u32) -> u32 {
        match self {
            Policy::Linear => 0,
            Policy::Adaptive => configured,
        }
    }

    pub fn allows_decomposition(self) -> bool {
        self == Policy::Adaptive
    }
}

/// Next stage for `event` observed in `stage`, or `None` if the pair is not
/// a legal edge.
pub fn transition(stage: Stage, event: &Event) -> Option<Stage> {
    use Stage::*;

    match (stage, event) {
        (MapIntent, Event::TableResolved) => Some(BuildSpec),
        (MapIntent, Event::NoTable) => Some(Fallback),
        (BuildSpec, Event::SpecBuilt { decompose: true }) => Some(Decompose),
        (BuildSpec, Event::SpecBuilt { decompose: false }) => Some(Execute),
        (Decompose, Event::NotDecomposable) => Some(Execute),
        (Decompose, Event::Decomposed { any_accepted: true }) => Some(Accept),
        (Decompose, Event::Decomposed { any_accepted: false }) => Some(Fallback),
        (Execute, Event::Executed) => Some(Validate),
        (
            Validate,
            Event::Validated {
                verdict,
                attempt,
                max_retries,
            },
        ) => {
            if verdict.accepted() {
                Some(Accept)
            } else if verdict.needs_refine() && attempt < max_retries {
                Some(Refine)
            } else {
                Some(Fallback)
            }
        }
        (Refine, Event::Refined) => Some(Execute),
        (Accept | Fallback, Event::Proceed) => Some(Narrate),
        (Narrate, Event::Narrated) => Some(Done),
        _ => None,
    }
}
