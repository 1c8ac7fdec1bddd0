use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a recipe.
///
/// The integer values are significant: workers advance `current_phase` one
/// step at a time and phase comparisons use this ordering everywhere in the
/// coordinator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Phase {
    RecipeLoad = 0,
    Check = 1,
    Fetch = 2,
    Stage = 3,
    Build = 4,
    Install = 5,
    Deploy = 6,
    Completion = 7,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::RecipeLoad,
        Phase::Check,
        Phase::Fetch,
        Phase::Stage,
        Phase::Build,
        Phase::Install,
        Phase::Deploy,
        Phase::Completion,
    ];

    /// Phases a dependency's `needed_by` may name.
    pub const NEEDED_BY: [Phase; 5] = [
        Phase::Check,
        Phase::Fetch,
        Phase::Stage,
        Phase::Build,
        Phase::Install,
    ];

    pub fn from_index(index: i32) -> Option<Phase> {
        Phase::ALL.get(usize::try_from(index).ok()?).copied()
    }

    pub fn index(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::RecipeLoad => "recipe-load",
            Phase::Check => "check",
            Phase::Fetch => "fetch",
            Phase::Stage => "stage",
            Phase::Build => "build",
            Phase::Install => "install",
            Phase::Deploy => "deploy",
            Phase::Completion => "completion",
        }
    }

    pub fn is_valid_needed_by(self) -> bool {
        Phase::NEEDED_BY.contains(&self)
    }
}

impl Default for Phase {
    /// The default dependency boundary.
    fn default() -> Self {
        Phase::Check
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
