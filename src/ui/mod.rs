pub mod prompt;
pub mod progress;

pub use prompt::{colored_level, ConsoleConfirmer};
pub use progress::{create_spinner, spawn_renderer, PlanProgress};
