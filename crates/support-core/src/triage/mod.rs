pub mod engine;
pub mod rule;

pub use engine::{RuleOutcome, TriageInput, TriageRuleEngine};
pub use rule::{RuleActions, RuleFacts, TimeWindow, TriageConditions, TriageRule};
