//! Google Calendar and Gmail, sharing one OAuth client.

pub mod calendar;
pub mod gmail;
pub mod oauth;

pub use calendar::GoogleCalendarAdapter;
pub use gmail::GmailAdapter;
pub use oauth::{GoogleOAuth, GoogleTokens};

use sundial_core::AdapterError;

use crate::http;

/// Both Google adapters built over one HTTP client.
pub fn adapters(
    client_id: &str,
    client_secret: &str,
) -> Result<(GoogleCalendarAdapter, GmailAdapter), AdapterError> {
    let client = http::client(http::DEFAULT_TIMEOUT)?;
    let oauth = GoogleOAuth::new(client.clone(), client_id, client_secret);
    Ok((
        GoogleCalendarAdapter::new(client.clone(), oauth.clone()),
        GmailAdapter::new(client, oauth),
    ))
}
