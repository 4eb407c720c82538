pub mod admin;
pub mod health;
pub mod queue;
pub mod ws;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::config::ANONYMOUS_USER;
use crate::queue::UserPlan;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_PLAN_HEADER: &str = "x-user-plan";

/// Who is calling, as asserted by the upstream gateway headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Option<String>,
    pub plan: UserPlan,
}

impl Caller {
    /// Key that owns the caller's jobs and runs.
    pub fn owner(&self) -> &str {
        self.user_id.as_deref().unwrap_or(ANONYMOUS_USER)
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        Ok(Caller {
            user_id: header(USER_ID_HEADER),
            plan: UserPlan::parse(header(USER_PLAN_HEADER).as_deref()),
        })
    }
}
