//! Contract model: pacts, interactions, messages, bodies and matching rules.

pub mod annotated;
pub mod body;
pub mod content_type;
pub mod interaction;
pub mod matchers;
pub mod message;
pub mod multipart;
pub mod pact;

pub use annotated::Annotated;
pub use body::Body;
pub use content_type::ContentType;
pub use interaction::{HttpInteraction, HttpRequest, HttpResponse, MultiValues, ProviderState};
pub use matchers::{Category, DocPath, HttpStatus, MatchingRule, MatchingRules, RuleList, RuleLogic};
pub use message::{AsyncMessage, MessageContents, SyncMessage};
pub use pact::{InteractionPart, Pact, PactInteraction, PluginDependency, SpecificationVersion};
