//! Provider implementations

use oauth2::basic::{BasicErrorResponse, BasicTokenType};
use oauth2::{
    Client, EmptyExtraTokenFields, EndpointNotSet, EndpointSet, StandardRevocableToken,
    StandardTokenIntrospectionResponse, StandardTokenResponse,
};

pub mod facebook;
pub mod google;
pub mod microsoft;

pub use facebook::FacebookProvider;
pub use google::GoogleProvider;
pub use microsoft::MicrosoftProvider;

/// Type alias for a client with auth and token endpoints configured
pub(crate) type ConfiguredClient = Client<
    BasicErrorResponse,
    StandardTokenResponse<EmptyExtraTokenFields, BasicTokenType>,
    StandardTokenIntrospectionResponse<EmptyExtraTokenFields, BasicTokenType>,
    StandardRevocableToken,
    BasicErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;
