//! Tailgate - expose inventory-managed apps on a private overlay network
//!
//! This library keeps a set of TLS-terminated reverse proxy endpoints in sync
//! with an inventory service:
//! - Polls the inventory for apps, their state and advertised portals
//! - Creates one endpoint per running app, bound to the app's name
//! - Retargets endpoints in place when an app's port changes
//! - Tears endpoints down when an app stops or disappears
//! - Rewrites redirects that leak a backend's address to the public name

pub mod config;
pub mod endpoint;
pub mod error;
pub mod inventory;
pub mod overlay;
pub mod poller;
pub mod pool;
pub mod reconcile;
pub mod redirect;
