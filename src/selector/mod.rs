//! Step Selector: ProjectState -> next agent, Blocked or Terminal.

mod routing;
mod select;

pub use routing::{KeywordPredicate, RouteMatch, RoutePredicate, RoutingRule, RoutingTable, tokenize};
pub use select::{Selection, SelectionReason, StepSelector};
