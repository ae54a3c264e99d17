//! aud-directives
//!
//! Buyer response handling for scheduled audience updates:
//! - parse the response body into join / leave / nested-schedule lists
//! - fuse each join entry with the owner's partial override
//! - validate sizes, names, and time horizons
//! - build the outbound request body
//!
//! Pure transforms. No IO, no clock: `now` is always passed in.

mod body;
mod limits;
mod parser;
mod report;
mod validate;

pub use body::{build_request_body, override_to_json};
pub use limits::DirectiveLimits;
pub use parser::{
    parse_override_json, parse_response, DirectiveError, MergeContext, NestedSchedule,
    ParsedDirectives,
};
pub use report::{DropReason, ParseReport};
pub use validate::{retain_valid_overrides, validate_override, validate_record};
