pub mod checksum;
pub mod errors;
pub mod key;
pub mod phase;
pub mod recipe;
pub mod spec;

pub use checksum::{Checksum, ChecksumDigest};
pub use errors::EnvyError;
pub use key::RecipeKey;
pub use phase::Phase;
pub use recipe::{DepEdge, ProductDep, Recipe, ResolvedDep};
pub use spec::{DependencySpec, OptionMap, OptionValue, RecipeSpec, ScriptSource};
