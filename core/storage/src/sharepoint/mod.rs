//! SharePoint document library provider.
//!
//! Talks to Microsoft Graph over HTTP:
//! - Static bearer tokens or OAuth2 client credentials with cached tokens
//! - Simple (single request) uploads up to 250 MiB
//! - Path-addressed drive items below an optional root folder

pub mod auth;
pub mod client;
pub mod provider;

pub use auth::{AccessToken, ClientCredentials, TokenManager, TokenSource};
pub use client::{DriveItem, DriveRef, GraphClient};
pub use provider::{create_sharepoint_provider, SharePointConfig, SharePointProvider};
