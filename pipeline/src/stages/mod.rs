mod filter_map;
mod identity;
mod tumbling_window;

pub use filter_map::FilterMapStage;
pub use identity::IdentityStage;
pub use tumbling_window::TumblingWindowStage;
