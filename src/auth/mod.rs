//! Authentication
//!
//! | Module     | Concern                                           |
//! |------------|---------------------------------------------------|
//! | `token`    | Token pair, credentials, login/refresh payloads   |
//! | `exchange` | `/auth/*` round trips behind the `AuthExchange` trait |
//! | `session`  | Token lifecycle, single-flight refresh, events    |

pub mod exchange;
pub mod session;
pub mod token;

pub use exchange::{AuthExchange, HttpAuthExchange};
pub use session::{AuthSession, AuthState, SessionEvent};
pub use token::{Credentials, TokenPair, TokenResponse, UserProfile};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const PROFILE_PATH: &str = "/auth/profile";
