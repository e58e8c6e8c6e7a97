pub mod mission;
pub mod prompt;
pub mod stream;

pub use mission::{MissionAgent, MissionRunner, MissionSettings};
pub use stream::{EventSender, MissionStream};
