use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use ulid::Ulid;

use crate::engine::now_ms;
use crate::model::{truncate_to_second, UserAccount};
use crate::observability;
use crate::store::{StoreError, UserStore};

pub use crate::model::Role;

/// Name of the built-in administrator account.
pub const ADMIN_USERNAME: &str = "admin";

/// An account declared in configuration, created at startup when missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffAccount {
    pub username: String,
    pub password: String,
    pub role: Role,
}

/// The identity a connection is bound to after a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Ulid,
    pub username: String,
    pub role: Role,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    fn of(user: &UserAccount) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            role: user.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    InvalidCredentials,
    /// The account exists but is inactive.
    UserBlocked,
    UserNotFound(Ulid),
    UsernameExists(String),
    LimitExceeded(&'static str),
    Timeout(&'static str),
    /// Detail is for logs only.
    Internal(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "invalid username or password"),
            AuthError::UserBlocked => write!(f, "user is blocked or inactive"),
            AuthError::UserNotFound(id) => write!(f, "user not found: {id}"),
            AuthError::UsernameExists(name) => write!(f, "username already exists: {name}"),
            AuthError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            AuthError::Timeout(op) => write!(f, "timed out during {op}"),
            AuthError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

fn internal(context: &str, err: impl std::fmt::Display) -> AuthError {
    tracing::error!("{context}: {err}");
    AuthError::Internal(format!("{context}: {err}"))
}

/// Staff accounts and the rules for managing them. Passwords are compared in
/// cleartext.
pub struct StaffDirectory {
    users: Arc<dyn UserStore>,
    timeout: Duration,
}

impl StaffDirectory {
    pub fn new(users: Arc<dyn UserStore>, timeout: Duration) -> Self {
        Self { users, timeout }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<Result<T, StoreError>, AuthError> {
        tokio::time::timeout(self.timeout, call).await.map_err(|_| {
            tracing::warn!("{op} did not finish within {:?}", self.timeout);
            metrics::counter!(observability::STORE_TIMEOUTS_TOTAL, "op" => op).increment(1);
            AuthError::Timeout(op)
        })
    }

    async fn find(&self, id: Ulid) -> Result<UserAccount, AuthError> {
        match self.bounded("find_user", self.users.find_user(id)).await? {
            Ok(user) => Ok(user),
            Err(StoreError::NotFound) => Err(AuthError::UserNotFound(id)),
            Err(e) => Err(internal("looking up user", e)),
        }
    }

    async fn save(&self, user: &UserAccount) -> Result<(), AuthError> {
        match self.bounded("update_user", self.users.update_user(user)).await? {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(AuthError::UserNotFound(user.id)),
            Err(StoreError::NameTaken(name)) => Err(AuthError::UsernameExists(name)),
            Err(e) => Err(internal("saving user", e)),
        }
    }

    /// Create the configured accounts that do not exist yet: the built-in
    /// admin (unless `staff` declares its own `admin`) and every staff entry.
    /// Returns how many were created.
    pub async fn bootstrap(&self, admin_password: &str, staff: &[StaffAccount]) -> Result<usize, AuthError> {
        let mut wanted = staff.to_vec();
        if !wanted.iter().any(|a| a.username == ADMIN_USERNAME) {
            wanted.insert(
                0,
                StaffAccount {
                    username: ADMIN_USERNAME.to_string(),
                    password: admin_password.to_string(),
                    role: Role::Admin,
                },
            );
        }

        let mut created = 0;
        for account in wanted {
            match self
                .bounded("find_user_by_username", self.users.find_user_by_username(&account.username))
                .await?
            {
                Ok(_) => continue,
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(internal("checking configured account", e)),
            }
            self.create_user(&account.username, &account.password, account.role, true)
                .await?;
            created += 1;
        }
        Ok(created)
    }

    pub async fn verify(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let user = match self
            .bounded("find_user_by_username", self.users.find_user_by_username(username))
            .await?
        {
            Ok(user) => user,
            Err(StoreError::NotFound) => return Err(AuthError::InvalidCredentials),
            Err(e) => return Err(internal("looking up user", e)),
        };
        if user.password != password {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::UserBlocked);
        }
        Ok(Session::of(&user))
    }

    /// Re-read the account behind `session`. `None` once it is deleted or blocked.
    pub async fn refresh(&self, session: &Session) -> Result<Option<Session>, AuthError> {
        match self.find(session.user_id).await {
            Ok(user) if user.is_active => Ok(Some(Session::of(&user))),
            Ok(_) | Err(AuthError::UserNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every account except `except`, ordered by username.
    pub async fn list_users(&self, except: Ulid) -> Result<Vec<UserAccount>, AuthError> {
        let all = self
            .bounded("list_users", self.users.list_users())
            .await?
            .map_err(|e| internal("listing users", e))?;
        Ok(all.into_iter().filter(|u| u.id != except).collect())
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
        is_active: bool,
    ) -> Result<UserAccount, AuthError> {
        let user = UserAccount {
            id: Ulid::new(),
            username: username.trim().to_string(),
            password: password.to_string(),
            role,
            is_active,
            created_at: truncate_to_second(now_ms()),
        };
        match self.bounded("insert_user", self.users.insert_user(&user)).await? {
            Ok(()) => {}
            Err(StoreError::NameTaken(name)) => return Err(AuthError::UsernameExists(name)),
            Err(StoreError::LimitReached(what)) => return Err(AuthError::LimitExceeded(what)),
            Err(e) => return Err(internal("saving user", e)),
        }
        info!("user {} created: {} ({})", user.id, user.username, user.role.as_str());
        Ok(user)
    }

    /// Replace username, role and active flag. The password is kept.
    pub async fn update_user(
        &self,
        id: Ulid,
        username: &str,
        role: Role,
        is_active: bool,
    ) -> Result<UserAccount, AuthError> {
        let mut user = self.find(id).await?;
        user.username = username.trim().to_string();
        user.role = role;
        user.is_active = is_active;
        self.save(&user).await?;
        info!("user {id} updated: {} ({}, active={is_active})", user.username, role.as_str());
        Ok(user)
    }

    /// Block or unblock an account. Unchanged accounts are not rewritten.
    pub async fn set_user_active(&self, id: Ulid, is_active: bool) -> Result<UserAccount, AuthError> {
        let mut user = self.find(id).await?;
        if user.is_active == is_active {
            return Ok(user);
        }
        user.is_active = is_active;
        self.save(&user).await?;
        info!("user {id} {}", if is_active { "unblocked" } else { "blocked" });
        Ok(user)
    }

    pub async fn delete_user(&self, id: Ulid) -> Result<(), AuthError> {
        match self.bounded("delete_user", self.users.delete_user(id)).await? {
            Ok(()) => {
                info!("user {id} deleted");
                Ok(())
            }
            Err(StoreError::NotFound) => Err(AuthError::UserNotFound(id)),
            Err(e) => Err(internal("deleting user", e)),
        }
    }

    /// Rename the account `id`. The only change a common user may make, and
    /// only to their own account.
    pub async fn update_username(&self, id: Ulid, username: &str) -> Result<UserAccount, AuthError> {
        let mut user = self.find(id).await?;
        user.username = username.trim().to_string();
        self.save(&user).await?;
        info!("user {id} renamed to {}", user.username);
        Ok(user)
    }
}
