//! GitHub-backed identity validation: turns a raw credential into a
//! `Principal` and checks it against the configured org/team requirements.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ErrorCode, ProxyError};
use crate::identity::classify::TokenShape;
use crate::ratelimit::TokenBucket;

/// A synthetic login recorded for installation-token principals, which have
/// no GitHub user identity of their own to report.
const INSTALLATION_PRINCIPAL_LOGIN: &str = "github-app-installation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Pat,
    Installation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub login: String,
    /// Organizations the principal is known to belong to (PAT flow) or, for
    /// an installation token, the single org/repo-owner it was minted for.
    pub orgs: Vec<String>,
    /// Teams that granted membership during validation. At most one entry:
    /// the first configured team that matched, per spec's "first team
    /// granting membership is recorded; others are not probed".
    pub teams: Vec<String>,
    pub credential_kind: CredentialKind,
    /// `owner/name` of the repository an installation token proved access
    /// to. Always `None` for a PAT-derived principal.
    pub repository: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthRequirement {
    pub required_org: Option<String>,
    pub required_teams: Vec<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn validate(
        &self,
        credential: &SecretString,
        shape: TokenShape,
        requirement: &AuthRequirement,
    ) -> Result<Principal, ProxyError>;
}

const API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Conservative defaults for the identity-provider rate-limit buffer: a
/// handful of requests per second with a small burst, well under GitHub's
/// per-token secondary rate limits, so a validation storm is smoothed out
/// rather than tripping GitHub's own throttling.
pub const DEFAULT_GITHUB_RATE_LIMIT_PER_SECOND: f64 = 10.0;
pub const DEFAULT_GITHUB_RATE_LIMIT_BURST: f64 = 20.0;

pub struct GitHubIdentityProvider {
    client: reqwest::Client,
    api_base: String,
    rate_limiter: TokenBucket,
}

impl GitHubIdentityProvider {
    pub fn new(rate_limit_per_second: f64, rate_limit_burst: f64) -> Self {
        Self::with_api_base(API_BASE.to_string(), rate_limit_per_second, rate_limit_burst)
    }

    pub fn with_api_base(api_base: String, rate_limit_per_second: f64, rate_limit_burst: f64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("registry-gateway")
            .build()
            .expect("reqwest client builds");
        Self { client, api_base, rate_limiter: TokenBucket::new(rate_limit_per_second, rate_limit_burst) }
    }

    async fn authenticated_user(&self, credential: &SecretString) -> Result<UserResponse, ProxyError> {
        let resp = self
            .client
            .get(format!("{}/user", self.api_base))
            .bearer_auth(credential.expose_secret())
            .send()
            .await
            .map_err(|e| ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProxyError::insufficient_permissions(format!(
                "github /user returned {}",
                resp.status()
            )));
        }
        resp.json::<UserResponse>()
            .await
            .map_err(|e| ProxyError::new(ErrorCode::InternalError, e.to_string()))
    }

    async fn org_membership(
        &self,
        credential: &SecretString,
        org: &str,
        login: &str,
    ) -> Result<bool, ProxyError> {
        let url = format!("{}/orgs/{org}/members/{login}", self.api_base);
        let resp = self
            .client
            .get(url)
            .bearer_auth(credential.expose_secret())
            .send()
            .await
            .map_err(|e| ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string()))?;
        // GitHub returns 204 for "is a member", 404 for "is not".
        Ok(resp.status() == reqwest::StatusCode::NO_CONTENT)
    }

    async fn team_membership(
        &self,
        credential: &SecretString,
        org: &str,
        team_slug: &str,
        login: &str,
    ) -> Result<bool, ProxyError> {
        let url = format!("{}/orgs/{org}/teams/{team_slug}/memberships/{login}", self.api_base);
        let resp = self
            .client
            .get(url)
            .bearer_auth(credential.expose_secret())
            .send()
            .await
            .map_err(|e| ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Ok(false);
        }
        let body: TeamMembershipResponse = resp
            .json()
            .await
            .map_err(|e| ProxyError::new(ErrorCode::InternalError, e.to_string()))?;
        Ok(body.state == "active")
    }

    /// Fetches the single repository (fetch-size one, for latency) the
    /// installation token can see. There is no `/user` endpoint for an
    /// installation token; this is how its scope is established instead.
    async fn installation_repository(
        &self,
        credential: &SecretString,
    ) -> Result<InstallationRepository, ProxyError> {
        let resp = self
            .client
            .get(format!("{}/installation/repositories", self.api_base))
            .query(&[("per_page", "1")])
            .bearer_auth(credential.expose_secret())
            .send()
            .await
            .map_err(|e| ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProxyError::insufficient_permissions(format!(
                "installation token rejected by /installation/repositories: {}",
                resp.status()
            )));
        }
        let body: InstallationRepositoriesResponse = resp
            .json()
            .await
            .map_err(|e| ProxyError::new(ErrorCode::InternalError, e.to_string()))?;
        body.repositories.into_iter().next().ok_or_else(|| {
            ProxyError::insufficient_permissions("installation token has no accessible repositories")
        })
    }

    /// An installation token is scoped server-side to one or more
    /// repositories; its owning org is derived from the first accessible
    /// repository rather than asserted by the caller.
    async fn installation_principal(
        &self,
        credential: &SecretString,
        requirement: &AuthRequirement,
    ) -> Result<Principal, ProxyError> {
        let repo = self.installation_repository(credential).await?;

        if let Some(required_org) = requirement.required_org.as_deref()
            && repo.owner.login != required_org
        {
            return Err(ProxyError::insufficient_permissions(format!(
                "installation token's accessible repository owner {} does not match required org {required_org}",
                repo.owner.login
            )));
        }

        Ok(Principal {
            login: INSTALLATION_PRINCIPAL_LOGIN.to_string(),
            orgs: vec![repo.owner.login.clone()],
            teams: vec![],
            credential_kind: CredentialKind::Installation,
            repository: Some(format!("{}/{}", repo.owner.login, repo.name)),
        })
    }
}

#[async_trait]
impl IdentityProvider for GitHubIdentityProvider {
    async fn validate(
        &self,
        credential: &SecretString,
        shape: TokenShape,
        requirement: &AuthRequirement,
    ) -> Result<Principal, ProxyError> {
        match shape {
            TokenShape::Unknown => {
                Err(ProxyError::new(ErrorCode::InvalidTokenShape, "unrecognized credential shape"))
            },
            TokenShape::Installation => {
                self.rate_limiter.acquire().await;
                self.installation_principal(credential, requirement).await
            },
            TokenShape::Pat => {
                self.rate_limiter.acquire().await;

                let user = self.authenticated_user(credential).await?;

                let Some(org) = requirement.required_org.as_deref() else {
                    return Ok(Principal {
                        login: user.login,
                        orgs: vec![],
                        teams: vec![],
                        credential_kind: CredentialKind::Pat,
                        repository: None,
                    });
                };

                if !self.org_membership(credential, org, &user.login).await? {
                    return Err(ProxyError::insufficient_permissions(format!(
                        "{} is not a member of {org}",
                        user.login
                    )));
                }

                let mut granting_team = None;
                if !requirement.required_teams.is_empty() {
                    for team in &requirement.required_teams {
                        if self.team_membership(credential, org, team, &user.login).await? {
                            granting_team = Some(team.clone());
                            break;
                        }
                    }
                    if granting_team.is_none() {
                        return Err(ProxyError::insufficient_permissions(format!(
                            "{} is not on any of the required teams in {org}",
                            user.login
                        )));
                    }
                }

                Ok(Principal {
                    login: user.login,
                    orgs: vec![org.to_string()],
                    teams: granting_team.into_iter().collect(),
                    credential_kind: CredentialKind::Pat,
                    repository: None,
                })
            },
        }
    }
}

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Deserialize)]
struct TeamMembershipResponse {
    state: String,
}

#[derive(Deserialize)]
struct InstallationRepositoriesResponse {
    repositories: Vec<InstallationRepository>,
}

#[derive(Deserialize)]
struct InstallationRepository {
    name: String,
    owner: RepoOwner,
}

#[derive(Deserialize)]
struct RepoOwner {
    login: String,
}
