//! Rate limiting logic and state management.

mod clock;
mod key_state;
mod limiter;
mod policy;
mod reaper;
mod registry;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Limiter, LimiterStats};
pub use policy::{PolicyConfig, RateLimitConfig, RateLimitRule};
pub use reaper::ReaperHandle;
pub use registry::LimiterRegistry;
pub use window::{TimeUnit, Window, WindowConfig, GRACE_MS};
