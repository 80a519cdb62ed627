//! Newline-delimited JSON request protocol.
//!
//! Each request is one JSON object on one line, selected by its `op` field.
//! Each reply is one JSON object with a `status` of `ok`, `error` or, on a
//! watching connection, `event`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Login {
        username: String,
        password: String,
    },
    Entry {
        vehicle_type_id: Ulid,
        license_plate: String,
    },
    Exit {
        license_plate: String,
    },
    Current,
    History,
    Record {
        id: Ulid,
    },
    VehicleTypes,
    CreateVehicleType {
        name: String,
        hourly_rate: Decimal,
        #[serde(default)]
        description: String,
    },
    UpdateVehicleType {
        id: Ulid,
        name: String,
        hourly_rate: Decimal,
        #[serde(default)]
        description: String,
    },
    DeleteVehicleType {
        id: Ulid,
    },
    Users,
    CreateUser {
        username: String,
        password: String,
        role: Role,
        #[serde(default = "active_by_default")]
        is_active: bool,
    },
    UpdateUser {
        id: Ulid,
        username: String,
        role: Role,
        is_active: bool,
    },
    SetUserActive {
        id: Ulid,
        is_active: bool,
    },
    DeleteUser {
        id: Ulid,
    },
    /// Rename the caller's own account.
    UpdateUsername {
        username: String,
    },
    Watch,
    Ping,
}

fn active_by_default() -> bool {
    true
}

impl Request {
    /// Whether the op changes the catalog or manages accounts and therefore needs an admin.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Request::CreateVehicleType { .. }
                | Request::UpdateVehicleType { .. }
                | Request::DeleteVehicleType { .. }
                | Request::Users
                | Request::CreateUser { .. }
                | Request::UpdateUser { .. }
                | Request::SetUserActive { .. }
                | Request::DeleteUser { .. }
        )
    }

    /// Whether the op is allowed before login.
    pub fn is_public(&self) -> bool {
        matches!(self, Request::Login { .. } | Request::Ping)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, unknown op, missing field or wrong field type.
    Malformed(String),
    /// Well-formed, but a field is out of bounds.
    Invalid(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed request: {e}"),
            ProtocolError::Invalid(e) => write!(f, "invalid request: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Decode one request line and check field bounds before anything reaches the engine.
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let req: Request = serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    validate(&req)?;
    Ok(req)
}

fn validate(req: &Request) -> Result<(), ProtocolError> {
    match req {
        Request::Login { username, .. }
        | Request::UpdateUser { username, .. }
        | Request::UpdateUsername { username } => {
            check_text("username", username, MAX_USERNAME_LEN)?;
        }
        Request::CreateUser { username, password, .. } => {
            check_text("username", username, MAX_USERNAME_LEN)?;
            check_text("password", password, MAX_PASSWORD_LEN)?;
        }
        Request::Entry { license_plate, .. } | Request::Exit { license_plate } => {
            check_text("license_plate", license_plate, MAX_PLATE_LEN)?;
        }
        Request::CreateVehicleType { name, description, .. }
        | Request::UpdateVehicleType { name, description, .. } => {
            check_text("name", name, MAX_NAME_LEN)?;
            if description.chars().count() > MAX_DESCRIPTION_LEN {
                return Err(ProtocolError::Invalid(format!(
                    "description longer than {MAX_DESCRIPTION_LEN} characters"
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_text(field: &str, value: &str, max: usize) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::Invalid(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(ProtocolError::Invalid(format!("{field} longer than {max} characters")));
    }
    Ok(())
}

// ── Replies ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    InvalidCredentials,
    UserBlocked,
    Conflict,
    NotFound,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::UserBlocked => "user_blocked",
            ErrorCode::Conflict => "conflict",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok { data: serde_json::Value },
    Error { code: ErrorCode, message: String },
    Event { event: EventView },
}

impl Reply {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Reply::Ok { data },
            Err(e) => Reply::error(ErrorCode::Internal, format!("failed to encode reply: {e}")),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Reply::Error {
            code,
            message: message.into(),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","code":"internal","message":"failed to encode reply: {e}"}}"#)
        })
    }
}

/// A parking record as clients see it: closure fields flattened and null while open.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordView {
    pub id: Ulid,
    pub user_id: String,
    pub vehicle_type_id: Ulid,
    pub license_plate: String,
    pub entry_time: Ms,
    pub exit_time: Option<Ms>,
    pub total_charge: Option<Decimal>,
    pub calculated_hours: Option<u32>,
}

impl From<&ParkingRecord> for RecordView {
    fn from(r: &ParkingRecord) -> Self {
        let closure = r.closure();
        Self {
            id: r.id,
            user_id: r.user_id.clone(),
            vehicle_type_id: r.vehicle_type_id,
            license_plate: r.license_plate.clone(),
            entry_time: r.entry_time,
            exit_time: closure.map(|c| c.exit_time),
            total_charge: closure.map(|c| c.total_charge),
            calculated_hours: closure.map(|c| c.calculated_hours),
        }
    }
}

pub fn record_views(records: &[ParkingRecord]) -> Vec<RecordView> {
    records.iter().map(RecordView::from).collect()
}

/// A staff account as clients see it. The password never leaves the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserView {
    pub id: Ulid,
    pub username: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: Ms,
}

impl From<&UserAccount> for UserView {
    fn from(u: &UserAccount) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            role: u.role,
            is_active: u.is_active,
            created_at: u.created_at,
        }
    }
}

pub fn user_views(users: &[UserAccount]) -> Vec<UserView> {
    users.iter().map(UserView::from).collect()
}

/// A committed lot event as pushed to watchers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventView {
    VehicleTypeCreated {
        vehicle_type: VehicleType,
    },
    VehicleTypeUpdated {
        vehicle_type: VehicleType,
    },
    VehicleTypeDeleted {
        id: Ulid,
    },
    EntryRecorded {
        record: RecordView,
    },
    ExitRecorded {
        id: Ulid,
        exit_time: Ms,
        total_charge: Decimal,
        calculated_hours: u32,
    },
}

impl EventView {
    /// The watcher view of `event`. Account events are not streamed.
    pub fn of(event: &Event) -> Option<Self> {
        let view = match event {
            Event::VehicleTypeCreated { vehicle_type } => EventView::VehicleTypeCreated {
                vehicle_type: vehicle_type.clone(),
            },
            Event::VehicleTypeUpdated { vehicle_type } => EventView::VehicleTypeUpdated {
                vehicle_type: vehicle_type.clone(),
            },
            Event::VehicleTypeDeleted { id } => EventView::VehicleTypeDeleted { id: *id },
            Event::EntryRecorded { record } => EventView::EntryRecorded { record: record.into() },
            Event::ExitRecorded { id, closure } => EventView::ExitRecorded {
                id: *id,
                exit_time: closure.exit_time,
                total_charge: closure.total_charge,
                calculated_hours: closure.calculated_hours,
            },
            Event::UserCreated { .. } | Event::UserUpdated { .. } | Event::UserDeleted { .. } => return None,
        };
        Some(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_entry() {
        let id = Ulid::new();
        let line = json!({"op": "entry", "vehicle_type_id": id.to_string(), "license_plate": "ABC123"}).to_string();
        assert_eq!(
            parse_request(&line).unwrap(),
            Request::Entry {
                vehicle_type_id: id,
                license_plate: "ABC123".into()
            }
        );
    }

    #[test]
    fn parse_unit_ops() {
        assert_eq!(parse_request(r#"{"op":"current"}"#).unwrap(), Request::Current);
        assert_eq!(parse_request(r#"{"op":"history"}"#).unwrap(), Request::History);
        assert_eq!(parse_request(r#"{"op":"vehicle_types"}"#).unwrap(), Request::VehicleTypes);
        assert_eq!(parse_request(r#"{"op":"watch"}"#).unwrap(), Request::Watch);
        assert_eq!(parse_request(r#"{"op":"ping"}"#).unwrap(), Request::Ping);
    }

    #[test]
    fn parse_vehicle_type_rate_as_string_or_number() {
        let from_str = parse_request(r#"{"op":"create_vehicle_type","name":"car","hourly_rate":"15.00"}"#).unwrap();
        let Request::CreateVehicleType {
            hourly_rate,
            description,
            ..
        } = from_str
        else {
            panic!("wrong op");
        };
        assert_eq!(hourly_rate, Decimal::new(1500, 2));
        assert_eq!(description, "");

        let from_num = parse_request(r#"{"op":"create_vehicle_type","name":"car","hourly_rate":15}"#).unwrap();
        assert!(matches!(from_num, Request::CreateVehicleType { hourly_rate, .. } if hourly_rate == Decimal::from(15)));
    }

    #[test]
    fn malformed_lines_rejected() {
        for line in [
            "not json",
            "{}",
            r#"{"op":"teleport"}"#,
            r#"{"op":"exit"}"#,
            r#"{"op":"record","id":"not-a-ulid"}"#,
            r#"{"op":"entry","vehicle_type_id":"01ARZ3NDEKTSV4RRFFQ69G5FA","license_plate":"X"}"#,
            r#"{"op":"exit","license_plate":42}"#,
        ] {
            assert!(
                matches!(parse_request(line), Err(ProtocolError::Malformed(_))),
                "accepted {line}"
            );
        }
    }

    #[test]
    fn plate_bounds_checked() {
        assert_eq!(
            parse_request(r#"{"op":"exit","license_plate":"   "}"#),
            Err(ProtocolError::Invalid("license_plate must not be empty".into()))
        );
        let long = "X".repeat(MAX_PLATE_LEN + 1);
        let line = json!({"op": "exit", "license_plate": long}).to_string();
        assert!(matches!(parse_request(&line), Err(ProtocolError::Invalid(_))));

        let exact = "X".repeat(MAX_PLATE_LEN);
        let line = json!({"op": "exit", "license_plate": exact}).to_string();
        assert!(parse_request(&line).is_ok());
    }

    #[test]
    fn vehicle_type_bounds_checked() {
        let line = json!({"op": "create_vehicle_type", "name": "", "hourly_rate": "1.00"}).to_string();
        assert!(matches!(parse_request(&line), Err(ProtocolError::Invalid(_))));

        let line = json!({
            "op": "create_vehicle_type",
            "name": "car",
            "hourly_rate": "1.00",
            "description": "d".repeat(MAX_DESCRIPTION_LEN + 1),
        })
        .to_string();
        assert!(matches!(parse_request(&line), Err(ProtocolError::Invalid(_))));

        // Negative rates are a catalog rule, not a framing one.
        let line = json!({"op": "create_vehicle_type", "name": "car", "hourly_rate": "-1.00"}).to_string();
        assert!(parse_request(&line).is_ok());
    }

    #[test]
    fn roles() {
        assert!(parse_request(r#"{"op":"delete_vehicle_type","id":"01ARZ3NDEKTSV4RRFFQ69G5FAV"}"#)
            .unwrap()
            .requires_admin());
        assert!(!Request::Current.requires_admin());
        assert!(Request::Ping.is_public());
        assert!(!Request::Watch.is_public());
    }

    #[test]
    fn reply_shapes() {
        let ok: serde_json::Value = serde_json::from_str(&Reply::ok("pong").to_line()).unwrap();
        assert_eq!(ok, json!({"status": "ok", "data": "pong"}));

        let err: serde_json::Value =
            serde_json::from_str(&Reply::error(ErrorCode::Conflict, "taken").to_line()).unwrap();
        assert_eq!(err, json!({"status": "error", "code": "conflict", "message": "taken"}));
        assert_eq!(ErrorCode::InvalidCredentials.as_str(), "invalid_credentials");
    }

    #[test]
    fn record_view_flattens_closure() {
        let mut record = ParkingRecord::open(Ulid::new(), "clerk".into(), Ulid::new(), "ABC123".into(), 1_000);
        let open = serde_json::to_value(RecordView::from(&record)).unwrap();
        assert_eq!(open["exit_time"], serde_json::Value::Null);
        assert_eq!(open["total_charge"], serde_json::Value::Null);
        assert_eq!(open["entry_time"], json!(1_000));

        record.stay = Stay::Closed(Closure {
            exit_time: 7_201_000,
            total_charge: Decimal::new(3000, 2),
            calculated_hours: 2,
        });
        let closed = serde_json::to_value(RecordView::from(&record)).unwrap();
        assert_eq!(closed["exit_time"], json!(7_201_000));
        assert_eq!(closed["total_charge"], json!("30.00"));
        assert_eq!(closed["calculated_hours"], json!(2));
    }

    #[test]
    fn event_view_is_tagged_by_kind() {
        let id = Ulid::new();
        let view = EventView::of(&Event::VehicleTypeDeleted { id }).unwrap();
        assert_eq!(
            serde_json::to_value(Reply::Event { event: view }).unwrap(),
            json!({"status": "event", "event": {"kind": "vehicle_type_deleted", "id": id.to_string()}})
        );
    }

    #[test]
    fn account_events_are_not_streamed() {
        let user = UserAccount {
            id: Ulid::new(),
            username: "ana".into(),
            password: "hunter2".into(),
            role: Role::Common,
            is_active: true,
            created_at: 1_000,
        };
        assert_eq!(EventView::of(&Event::UserCreated { user: user.clone() }), None);
        assert_eq!(EventView::of(&Event::UserDeleted { id: user.id }), None);

        let view = serde_json::to_value(UserView::from(&user)).unwrap();
        assert_eq!(view["role"], "common");
        assert_eq!(view["is_active"], true);
        assert!(view.get("password").is_none());
    }

    #[test]
    fn parse_user_ops() {
        let line = r#"{"op":"create_user","username":"ana","password":"pw","role":"admin"}"#;
        assert_eq!(
            parse_request(line).unwrap(),
            Request::CreateUser {
                username: "ana".into(),
                password: "pw".into(),
                role: Role::Admin,
                is_active: true,
            }
        );
        let id = Ulid::new();
        let line = json!({"op": "set_user_active", "id": id.to_string(), "is_active": false}).to_string();
        assert_eq!(parse_request(&line).unwrap(), Request::SetUserActive { id, is_active: false });
        assert!(!parse_request(r#"{"op":"update_username","username":"x"}"#).unwrap().requires_admin());
        assert!(parse_request(r#"{"op":"users"}"#).unwrap().requires_admin());

        for line in [
            r#"{"op":"create_user","username":"ana","password":"pw","role":"root"}"#,
            r#"{"op":"update_user","id":"01ARZ3NDEKTSV4RRFFQ69G5FAV","username":"ana","role":"common"}"#,
        ] {
            assert!(matches!(parse_request(line), Err(ProtocolError::Malformed(_))), "accepted {line}");
        }
        for line in [
            r#"{"op":"create_user","username":"ana","password":"","role":"common"}"#,
            r#"{"op":"update_username","username":"  "}"#,
        ] {
            assert!(matches!(parse_request(line), Err(ProtocolError::Invalid(_))), "accepted {line}");
        }
    }
}
