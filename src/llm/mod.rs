pub mod client;
pub mod generator;
pub mod schema;

pub use generator::{
    CachedGenerator, DecodingParams, Example, GenerationRequest, RateLimitedGenerator, TextGenerator,
};
pub use schema::{FieldKind, ResponseSchema};
