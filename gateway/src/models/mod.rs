pub mod token;

pub use token::{
    digest_value, Identity, IdentityError, IssuedToken, TokenRecord, TokenSecret, TokenState,
    TokenStatus,
};
