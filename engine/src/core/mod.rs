//! Core infrastructure shared by every subsystem

pub mod time;

pub use time::{
    AdvancingSleeper, Clock, ManualClock, NoopSleeper, Sleeper, SystemClock, ThreadSleeper,
};
