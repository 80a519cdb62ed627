use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{info, warn};

use crate::auth::{AuthError, Session, StaffDirectory};
use crate::engine::{EngineError, ParkingEngine};
use crate::limits::MAX_LINE_LEN;
use crate::model::Event;
use crate::notify::NotifyHub;
use crate::observability;
use crate::protocol::*;
use crate::store::LotStore;

/// Everything a connection needs, shared by all of them.
pub struct ServerContext {
    pub engine: ParkingEngine,
    pub staff: StaffDirectory,
    pub notify: Arc<NotifyHub>,
}

impl ServerContext {
    /// Wire the engine and the staff directory to `store`, which serves as
    /// record store, rate catalog and account store.
    pub fn new(store: LotStore, notify: Arc<NotifyHub>, store_timeout: Duration) -> Self {
        let engine = ParkingEngine::new(Arc::new(store.clone()), Arc::new(store.clone()), store_timeout);
        let staff = StaffDirectory::new(Arc::new(store), store_timeout);
        Self { engine, staff, notify }
    }
}

/// Per-connection state.
#[derive(Default)]
struct Connection {
    session: Option<Session>,
    watch: Option<broadcast::Receiver<Event>>,
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, ctx: Arc<ServerContext>) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut conn = Connection::default();

    loop {
        tokio::select! {
            incoming = framed.next() => {
                let line = match incoming {
                    Some(Ok(line)) => line,
                    // The codec skips the rest of the oversized line and keeps going.
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Reply::error(
                            ErrorCode::BadRequest,
                            format!("request line longer than {MAX_LINE_LEN} bytes"),
                        );
                        framed.send(reply.to_line()).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handle_line(&ctx, &mut conn, &line).await;
                framed.send(reply.to_line()).await?;
            }
            Some(event) = next_event(&mut conn.watch) => {
                let Some(event) = EventView::of(&event) else {
                    continue;
                };
                framed.send(Reply::Event { event }.to_line()).await?;
            }
        }
    }

    if let Some(session) = &conn.session {
        info!("{} disconnected", session.username);
    }
    Ok(())
}

/// Next event for a watching connection. Pending forever while not watching.
async fn next_event(watch: &mut Option<broadcast::Receiver<Event>>) -> Option<Event> {
    let Some(rx) = watch.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(event) => Some(event),
        Err(RecvError::Lagged(skipped)) => {
            warn!("watcher lagged, skipped {skipped} events");
            None
        }
        Err(RecvError::Closed) => {
            *watch = None;
            None
        }
    }
}

async fn handle_line(ctx: &ServerContext, conn: &mut Connection, line: &str) -> Reply {
    let req = match parse_request(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request")
                .increment(1);
            return Reply::error(ErrorCode::BadRequest, e.to_string());
        }
    };

    let op = observability::op_label(&req);
    let start = Instant::now();
    let reply = dispatch(ctx, conn, req).await;
    let status = match &reply {
        Reply::Error { code, .. } => code.as_str(),
        _ => "ok",
    };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());
    reply
}

async fn dispatch(ctx: &ServerContext, conn: &mut Connection, req: Request) -> Reply {
    match &req {
        Request::Ping => return Reply::ok("pong"),
        Request::Login { username, password } => return login(ctx, conn, username, password).await,
        _ => {}
    }

    let Some(session) = conn.session.take() else {
        return Reply::error(ErrorCode::Unauthenticated, "login required");
    };
    // Re-read the account so blocking, deleting or demoting it applies to open connections.
    let session = match ctx.staff.refresh(&session).await {
        Ok(Some(fresh)) => fresh,
        Ok(None) => {
            info!("session of {} ended: account blocked or removed", session.username);
            conn.watch = None;
            return Reply::error(ErrorCode::Unauthenticated, "account blocked or removed, login again");
        }
        Err(e) => {
            conn.session = Some(session);
            return auth_reply(&e);
        }
    };
    conn.session = Some(session.clone());
    if req.requires_admin() && !session.is_admin() {
        return Reply::error(ErrorCode::Forbidden, "admin role required");
    }
    let user_id = session.user_id.to_string();
    let user = user_id.as_str();
    let engine = &ctx.engine;
    let staff = &ctx.staff;

    match req {
        Request::Entry {
            vehicle_type_id,
            license_plate,
        } => respond(engine.record_entry(user, vehicle_type_id, &license_plate).await.map(|r| RecordView::from(&r))),
        Request::Exit { license_plate } => {
            respond(engine.record_exit(user, &license_plate).await.map(|r| RecordView::from(&r)))
        }
        Request::Current => respond(engine.currently_parked().await.map(|r| record_views(&r))),
        Request::History => respond(engine.history().await.map(|r| record_views(&r))),
        Request::Record { id } => respond(engine.record_by_id(id).await.map(|r| RecordView::from(&r))),
        Request::VehicleTypes => respond(engine.list_vehicle_types().await),
        Request::CreateVehicleType {
            name,
            hourly_rate,
            description,
        } => respond(engine.create_vehicle_type(&name, hourly_rate, &description).await),
        Request::UpdateVehicleType {
            id,
            name,
            hourly_rate,
            description,
        } => respond(engine.update_vehicle_type(id, &name, hourly_rate, &description).await),
        Request::DeleteVehicleType { id } => {
            respond(engine.delete_vehicle_type(id).await.map(|()| json!({ "deleted": id })))
        }
        Request::Users => respond_auth(staff.list_users(session.user_id).await.map(|u| user_views(&u))),
        Request::CreateUser {
            username,
            password,
            role,
            is_active,
        } => respond_auth(
            staff
                .create_user(&username, &password, role, is_active)
                .await
                .map(|u| UserView::from(&u)),
        ),
        Request::UpdateUser {
            id,
            username,
            role,
            is_active,
        } => respond_auth(
            staff
                .update_user(id, &username, role, is_active)
                .await
                .map(|u| UserView::from(&u)),
        ),
        Request::SetUserActive { id, is_active } => {
            respond_auth(staff.set_user_active(id, is_active).await.map(|u| UserView::from(&u)))
        }
        Request::DeleteUser { id } => respond_auth(staff.delete_user(id).await.map(|()| json!({ "deleted": id }))),
        Request::UpdateUsername { username } => respond_auth(
            staff
                .update_username(session.user_id, &username)
                .await
                .map(|u| UserView::from(&u)),
        ),
        Request::Watch => {
            if conn.watch.is_none() {
                conn.watch = Some(ctx.notify.subscribe());
                info!("{} is watching lot events", session.username);
            }
            Reply::ok("watching")
        }
        // Answered before the session check.
        Request::Login { .. } | Request::Ping => Reply::ok(json!(null)),
    }
}

async fn login(ctx: &ServerContext, conn: &mut Connection, username: &str, password: &str) -> Reply {
    match ctx.staff.verify(username, password).await {
        Ok(session) => {
            info!("{} logged in", session.username);
            let reply = Reply::ok(json!({
                "id": session.user_id,
                "username": session.username,
                "role": session.role,
            }));
            conn.session = Some(session);
            reply
        }
        Err(e @ (AuthError::InvalidCredentials | AuthError::UserBlocked)) => {
            warn!("failed login for {username:?}: {e}");
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            auth_reply(&e)
        }
        Err(e) => auth_reply(&e),
    }
}

fn respond<T: serde::Serialize>(result: Result<T, EngineError>) -> Reply {
    match result {
        Ok(data) => Reply::ok(data),
        Err(e) => engine_reply(&e),
    }
}

fn respond_auth<T: serde::Serialize>(result: Result<T, AuthError>) -> Reply {
    match result {
        Ok(data) => Reply::ok(data),
        Err(e) => auth_reply(&e),
    }
}

/// Map an account failure to its wire code. Internal detail stays in the logs.
pub fn auth_reply(e: &AuthError) -> Reply {
    let code = match e {
        AuthError::InvalidCredentials => ErrorCode::InvalidCredentials,
        AuthError::UserBlocked => ErrorCode::UserBlocked,
        AuthError::UserNotFound(_) => ErrorCode::NotFound,
        AuthError::UsernameExists(_) => ErrorCode::Conflict,
        AuthError::LimitExceeded(_) => ErrorCode::BadRequest,
        AuthError::Timeout(_) => ErrorCode::Timeout,
        AuthError::Internal(_) => return Reply::error(ErrorCode::Internal, "internal error"),
    };
    Reply::error(code, e.to_string())
}

/// Map an engine failure to its wire code. Internal detail is already logged
/// by the engine and never sent to the client.
pub fn engine_reply(e: &EngineError) -> Reply {
    let code = match e {
        EngineError::ActiveParkingAlreadyExists(_)
        | EngineError::VehicleTypeNameExists(_)
        | EngineError::VehicleTypeInUse(_) => ErrorCode::Conflict,
        EngineError::ActiveParkingNotFound(_)
        | EngineError::VehicleTypeNotFound(_)
        | EngineError::ParkingRecordNotFound(_) => ErrorCode::NotFound,
        EngineError::InvalidRate(_) | EngineError::LimitExceeded(_) => ErrorCode::BadRequest,
        EngineError::Timeout(_) => ErrorCode::Timeout,
        EngineError::Internal(_) => return Reply::error(ErrorCode::Internal, "internal error"),
    };
    Reply::error(code, e.to_string())
}
