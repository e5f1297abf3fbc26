//! Networks: encoder stand-ins, projection heads, the online evaluator head
//! and the downstream classifier.

pub mod classifier;
pub mod encoder;
pub mod evaluator;
pub mod projection;
