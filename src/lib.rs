// standard library imports
use thiserror::Error;
use yaml_rust::Yaml;

// imports of other modules from this crate
mod supply;
pub use supply::{Attributes, NamedWeights, Supply, TripInfo, TripStop, TripStopTime, UserClassMode};

mod label_queue;
pub use label_queue::{LabelStop, LabelStopQueue};

mod path_states;
pub use path_states::{
    DepArrMode, HyperpathState, Path, PathInfo, PerformanceInfo, StopState, StopStates,
};

mod trace;
pub use trace::TraceContext;

mod pathfinder;
pub use pathfinder::{FoundPath, PathFinder, PathSpecification, PROBABILITY_SCALE};

pub mod config_utils;


/// Host-supplied search parameters, shared by every `find_path` call.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Width of the admissible time window around a stop's envelope time, in minutes.
    pub time_window: f64,
    /// Extra minutes a bumped passenger leaves early to get in line.
    pub bump_buffer: f64,
    /// Number of candidate paths sampled per stochastic search.
    pub stoch_pathset_size: i32,
    /// Dispersion (scale) of the soft-max choice; larger means more deterministic.
    pub stoch_dispersion: f64,
    /// Cap on how often a single stop may be relaxed in hyperpath mode; 0 disables.
    pub stoch_max_stop_process_count: i32,
}

impl Default for SearchParams {
    fn default() -> SearchParams {
        return SearchParams {
            time_window: 30.0,
            bump_buffer: 5.0,
            stoch_pathset_size: 1000,
            stoch_dispersion: 1.0,
            stoch_max_stop_process_count: 20,
        };
    }
}

impl SearchParams {
    pub fn from_yaml(yaml_cfg: &Yaml) -> SearchParams {
        return SearchParams {
            time_window: yaml_number(yaml_cfg, "time_window_min"),
            bump_buffer: yaml_number(yaml_cfg, "bump_buffer_min"),
            stoch_pathset_size: yaml_cfg["stoch_pathset_size"].as_i64().
                expect("no stoch pathset size") as i32,
            stoch_dispersion: yaml_number(yaml_cfg, "stoch_dispersion"),
            stoch_max_stop_process_count: yaml_cfg["stoch_max_stop_process_count"].as_i64().
                expect("no stoch max stop process count") as i32,
        };
    }
}

// yaml represents whole numbers as integers even where we want a float
fn yaml_number(yaml_cfg: &Yaml, key: &str) -> f64 {
    yaml_cfg[key].as_f64()
        .or_else(|| yaml_cfg[key].as_i64().map(|vv| vv as f64))
        .unwrap_or_else(|| panic!("no {}", key))
}


#[derive(Debug, Error)]
pub enum PathfinderError {
    #[error("no weights configured for user class [{user_class}], {demand_mode_type} mode [{demand_mode}]")]
    MissingWeights {
        user_class: String,
        demand_mode_type: &'static str,
        demand_mode: String,
    },
    #[error("TAZ {0} has no access or egress links")]
    NoAccessEgressLinks(i32),
    #[error("label stop queue invariant violated: {0}")]
    QueueInvariant(&'static str),
    #[error("trip {trip_id} stop sequence broken at row {row}: expected {expected}, got {got}")]
    BadStopSequence {
        trip_id: i32,
        row: usize,
        expected: i32,
        got: i32,
    },
    #[error("{name} array has wrong shape: expected {expected}, got {got}")]
    BadArrayShape {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
