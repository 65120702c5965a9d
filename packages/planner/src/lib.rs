//! # Planner
//!
//! Travel itinerary planner built on the caravan saga runtime. A
//! request fans out across categories (hotel, flight, activity,
//! restaurant, car) through a pipeline of stages - candidate
//! generation, validation, ranking, selection, enrichment, output -
//! coordinated by a templated saga and a shared blackboard.

pub mod categories;
pub mod runtime;
pub mod stages;
pub mod system;
pub mod templates;

pub use categories::Category;
pub use runtime::{build_runtime, blackboard_config, PlannerRuntime};
pub use templates::{travel_planning, travel_planning_basic, BASIC_TEMPLATE, TRAVEL_TEMPLATE};
