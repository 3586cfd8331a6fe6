pub mod handoff;
pub mod pipeline;
pub mod preview;
pub mod similarity;
pub mod trigger;
pub mod window;
