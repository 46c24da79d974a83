//! Connection monitoring helpers

pub use self::{flow::FlowStat, mon_stream::MonStream};

pub mod flow;
pub mod mon_stream;
