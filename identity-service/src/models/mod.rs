pub mod federated_identity;
pub mod membership;
pub mod permission;
pub mod refresh_session;
pub mod resource;
pub mod role;
pub mod user;

pub use federated_identity::{FederatedIdentity, IdentityResponse};
pub use membership::{MemberScope, Membership};
pub use permission::{is_known_permission, permission_catalog, Permission, ResourceType};
pub use refresh_session::{ClientMeta, RefreshSession, SessionDraft, SessionInfo};
pub use resource::{Board, Project};
pub use role::{Role, RoleWithPermissions, SystemRole};
pub use user::{User, UserResponse};
