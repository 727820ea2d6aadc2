//! # forge-shell: the editor session shell
//!
//! Composes the collaboration layer and the generation orchestrator into a
//! user session: an editor surface bound to the shared document, an
//! assistant chat, a project manager and an echo terminal. Records can be
//! kept across runs in a JSON snapshot.

pub mod chat;
pub mod config;
pub mod error;
pub mod projects;
pub mod session;
pub mod store;
pub mod terminal;

pub use chat::{references_note, ChatMessage, ChatTranscript, Speaker, ERROR_REPLY, GREETING};
pub use config::ShellConfig;
pub use error::ShellError;
pub use projects::{Deployment, DeploymentState, DeploymentStatus, ProjectManager};
pub use session::{Panels, PromptOutcome, Session};
pub use store::{open_store, persist_store};
pub use terminal::TerminalPane;
