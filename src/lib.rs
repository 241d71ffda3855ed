//! Invoice retrieval from the Portuguese e-Fatura portal.
//!
//! A [`PortalSession`] logs in through the portal's HTML forms, keeps the session
//! cookies the login produced and replays them on the JSON endpoint the portal's
//! own front-end reads invoices from.

pub mod config;
pub mod portal;

pub use config::ClientSettings;
pub use portal::{
    AuthenticatedSession, Browser, Credentials, DateRange, DateRangeError, HttpBrowser,
    InvalidRangePolicy, PortalEndpoints, PortalError, PortalResult, PortalSession,
};
