// Route module decomposition — each domain area in its own file.
// Shared types (request guards, error translation) live here; route
// functions in submodules.

mod groups;
#[path = "listen.rs"]
mod listen_route;
mod messages;
mod send;
mod system;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use groups::{group_inbox, join_group};
pub use listen_route::listen;
pub use messages::{delete_message, get_message, list_messages, mark_read, update_message};
pub use send::{send_batch, send_message};
pub use system::{health, not_found, unauthorized};

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;

use crate::error::{GroupError, HistoryError, QueueError};

// --- Caller identity ---

/// Trust-based caller identity, handed to every route. Credential-to-account
/// resolution lives in front of this service; what arrives here are the
/// resolved claims.
///
/// Headers: `X-Gamespace-Id` (integer), `X-Account-Id`, and optionally
/// `X-Authoritative` (`1`/`true`) for sessions bearing the privileged
/// scope.
pub struct Caller {
    pub gamespace_id: i64,
    pub account_id: String,
    pub authoritative: bool,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Caller {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let gamespace_id = req
            .headers()
            .get_one("X-Gamespace-Id")
            .and_then(|v| v.trim().parse::<i64>().ok());
        let account_id = req
            .headers()
            .get_one("X-Account-Id")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let (Some(gamespace_id), Some(account_id)) = (gamespace_id, account_id) else {
            return Outcome::Error((Status::Unauthorized, ()));
        };

        let authoritative = req
            .headers()
            .get_one("X-Authoritative")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Outcome::Success(Caller {
            gamespace_id,
            account_id,
            authoritative,
        })
    }
}

// --- Error translation ---

pub type ApiError = (Status, Json<serde_json::Value>);

pub(crate) fn history_error(e: HistoryError) -> ApiError {
    (
        e.status(),
        Json(serde_json::json!({"error": e.public_message()})),
    )
}

pub(crate) fn group_error(e: GroupError) -> ApiError {
    (
        e.status(),
        Json(serde_json::json!({"error": e.public_message()})),
    )
}

pub(crate) fn queue_error(e: QueueError) -> ApiError {
    (e.status(), Json(serde_json::json!({"error": e.to_string()})))
}

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    (
        Status::BadRequest,
        Json(serde_json::json!({"error": message.into()})),
    )
}
