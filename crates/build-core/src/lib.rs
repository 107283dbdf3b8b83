pub mod compiler;
pub mod conditions;
pub mod configs;
pub mod crds;
pub mod extractor;
pub mod labels;
pub mod resolver;
pub mod validate;
