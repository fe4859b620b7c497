use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Tenant scope for every remote call: one project inside one organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    pub organization: String,
    pub project: String,
}

impl Context {
    pub fn new(organization: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
        }
    }

    /// URL path prefix for project-scoped Loop endpoints,
    /// e.g. `/zauberzeug/projects/demo`.
    pub fn api_prefix(&self) -> String {
        format!("/{}/projects/{}", self.organization, self.project)
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization, self.project)
    }
}
