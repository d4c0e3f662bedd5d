pub mod adaptive;
pub mod bandwidth;
pub mod bot;
pub mod fault;
pub mod priority;
pub mod throttle;

pub use adaptive::AdaptiveLimiter;
pub use bandwidth::BandwidthLimiter;
pub use bot::BotDetector;
pub use fault::FaultInjector;
pub use priority::{LevelSelector, PriorityAdmitter};
pub use throttle::Throttler;
