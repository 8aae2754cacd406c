//! The inbound dispatch pipeline.
//!
//! Runs on its own task per request.  Resolves the controller and action,
//! applies the permission policy, deserializes arguments positionally,
//! invokes the handler through a fresh controller scope, and enqueues the
//! response.  Requests without a uid (notifications) run the same pipeline
//! with the response discarded.
//!
//! Controller failures never cross the wire verbatim: only the
//! `BadRequest` kind keeps its message, everything else is logged locally
//! and masked as `InternalError("Internal Server Error")`.

use crate::auth::{token_from_wire, TokenError};
use crate::connection::{Connection, ConnectionShared};
use crate::outbound::Outbound;
use crate::registry::{ActionError, ActionResult, CallContext};
use serde_json::value::RawValue;
use std::sync::Arc;
use tandem_protocol::{
    encode_message, encoding, ActionName, Header, RequestBodyRef, Status,
};
use tracing::{debug, error, warn};

pub(crate) async fn handle_request(shared: Arc<ConnectionShared>, header: Header, payload: Vec<u8>) {
    let uid = header.uid;
    if uid.is_some() && !shared.inflight.try_begin_request() {
        debug!(conn_id = %shared.id, uid = ?uid, "request arrived after shutdown drained; dropped");
        return;
    }

    let outcome = run_pipeline(&shared, &header, &payload).await;

    let Some(uid) = uid else {
        // Notification: the pipeline ran for its side effects only.
        return;
    };
    respond(&shared, uid, outcome);
}

fn respond(shared: &Arc<ConnectionShared>, uid: i32, outcome: ActionResult) {
    let mut header = Header::response(outcome.status, uid, 0);
    header.payload_encoding = outcome.encoding.clone();
    let message = match encode_message(header, &outcome.payload) {
        Ok(message) => message,
        Err(e) => {
            error!(conn_id = %shared.id, uid, err = %e, "response framing failed");
            let fallback = ActionResult::error(Status::InternalError, "Internal Server Error");
            let header = Header::response(Status::InternalError, uid, 0);
            match encode_message(header, &fallback.payload) {
                Ok(message) => message,
                Err(_) => {
                    if shared.inflight.complete_response() {
                        shared.close_after_drain();
                    }
                    return;
                }
            }
        }
    };
    if !shared.enqueue(Outbound::Response { message }) && shared.inflight.complete_response() {
        shared.close_after_drain();
    }
}

async fn run_pipeline(
    shared: &Arc<ConnectionShared>,
    header: &Header,
    payload: &[u8],
) -> ActionResult {
    let raw_name = header.action_name.as_deref().unwrap_or_default();
    let Some(name) = ActionName::parse(raw_name) else {
        return ActionResult::error(Status::InvalidRequest, "Invalid action name.");
    };

    if name.is_internal() {
        return handle_internal(shared, &name, payload).await;
    }

    let Some(dispatch) = &shared.dispatch else {
        return not_found(&name);
    };
    let Some(controller) = dispatch.registry.controller_entry(&name.controller) else {
        return not_found(&name);
    };
    let Some(binding) = controller.find_action(&name.action) else {
        return not_found(&name);
    };

    if dispatch.enforce_auth
        && !controller.allow_anonymous
        && !binding.markers.allow_anonymous
        && !lock_principal(shared).is_authenticated()
    {
        return ActionResult::error(
            Status::Unauthorized,
            format!("Action {name} requires user authentication."),
        );
    }

    if header
        .payload_encoding
        .as_deref()
        .is_some_and(|e| e != encoding::JSON)
    {
        return ActionResult::error(Status::BadRequest, "Unsupported request payload encoding.");
    }

    let args = match parse_args(payload) {
        Ok(args) => args,
        Err(message) => return ActionResult::error(Status::BadRequest, message),
    };
    if args.len() != binding.arity {
        return ActionResult::error(Status::BadRequest, "Argument count mismatch.");
    }

    let mut scope = dispatch.scopes.new_scope();
    let Some(instance) = scope.resolve(&controller.name) else {
        error!(conn_id = %shared.id, controller = %controller.name, "scope produced no controller instance");
        return ActionResult::error(Status::InternalError, "Internal Server Error");
    };

    let ctx = CallContext {
        connection: Connection {
            shared: shared.clone(),
        },
        principal: lock_principal(shared).clone(),
        action: name.clone(),
    };

    let result = binding.invoke(instance, ctx, args).await;
    drop(scope);

    match result {
        Ok(mut action_result) => {
            if binding.markers.produces_protobuf && action_result.encoding.is_none() {
                action_result.encoding = Some(encoding::PROTOBUF.to_owned());
            }
            action_result
        }
        Err(ActionError::BadRequest(message)) => {
            ActionResult::error(Status::BadRequest, message)
        }
        Err(ActionError::Internal(message)) => {
            warn!(conn_id = %shared.id, action = %name, err = %message, "action failed");
            ActionResult::error(Status::InternalError, "Internal Server Error")
        }
    }
}

fn not_found(name: &ActionName) -> ActionResult {
    ActionResult::error(Status::NotFound, format!("Action {name} not found."))
}

fn lock_principal(shared: &ConnectionShared) -> std::sync::MutexGuard<'_, crate::auth::Principal> {
    shared
        .principal
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn parse_args(payload: &[u8]) -> Result<Vec<Box<RawValue>>, String> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let body: RequestBodyRef<'_> = serde_json::from_slice(payload)
        .map_err(|e| format!("Malformed request payload: {e}"))?;
    Ok(body.args.iter().map(|raw| (*raw).to_owned()).collect())
}

// ---------------------------------------------------------------------------
// Reserved internal actions (empty controller name)
// ---------------------------------------------------------------------------

async fn handle_internal(
    shared: &Arc<ConnectionShared>,
    name: &ActionName,
    payload: &[u8],
) -> ActionResult {
    match name.action.to_ascii_lowercase().as_str() {
        "signin" => sign_in(shared, payload),
        "signout" => sign_out(shared),
        _ => not_found(name),
    }
}

fn sign_in(shared: &Arc<ConnectionShared>, payload: &[u8]) -> ActionResult {
    let Some(vault) = shared.dispatch.as_ref().and_then(|d| d.vault.clone()) else {
        return ActionResult::error(Status::BadRequest, "token invalid");
    };
    let args = match parse_args(payload) {
        Ok(args) => args,
        Err(message) => return ActionResult::error(Status::BadRequest, message),
    };
    let [token_arg] = args.as_slice() else {
        return ActionResult::error(Status::BadRequest, "Argument count mismatch.");
    };
    let Ok(wire_token) = serde_json::from_str::<String>(token_arg.get()) else {
        return ActionResult::error(Status::BadRequest, "token invalid");
    };
    let token = match token_from_wire(&wire_token) {
        Ok(token) => token,
        Err(_) => return ActionResult::error(Status::BadRequest, "token invalid"),
    };
    match vault.verify(&token) {
        Ok(principal) => {
            debug!(conn_id = %shared.id, user = principal.name.as_deref().unwrap_or_default(), "peer signed in");
            *lock_principal(shared) = principal.clone();
            shared.authenticated.emit(&principal);
            ok_null()
        }
        Err(TokenError::Expired) => ActionResult::error(Status::BadRequest, "token expired"),
        Err(_) => ActionResult::error(Status::BadRequest, "token invalid"),
    }
}

fn sign_out(shared: &Arc<ConnectionShared>) -> ActionResult {
    debug!(conn_id = %shared.id, "peer signed out");
    *lock_principal(shared) = crate::auth::Principal::anonymous();
    ok_null()
}

fn ok_null() -> ActionResult {
    ActionResult {
        status: Status::Ok,
        payload: b"null".to_vec(),
        encoding: None,
    }
}
