//! Remote repository listing
//!
//! Discovery asks a [`RepositoryLister`] for every repository the account
//! can see. [`GitHubLister`] pages through the GitHub REST API.

pub mod error;
pub mod rate_limit;

pub use error::{GitHubError, GitHubResult};

use crate::config::GitHubConfig;
use crate::core::sync::recover_poison;
use crate::core::time::TimeProvider;
use async_trait::async_trait;
use octocrab::models::Repository as ApiRepository;
use octocrab::{Octocrab, Page};
use std::sync::{Arc, Mutex};

const PER_PAGE: u8 = 100;

/// A repository as reported by the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub owner: String,
    pub name: String,
    pub ssh_url: String,
    pub private: bool,
    pub default_branch: String,
}

impl RemoteRepository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[async_trait]
pub trait RepositoryLister: Send + Sync {
    async fn list_repositories(&self) -> GitHubResult<Vec<RemoteRepository>>;
}

pub struct GitHubLister {
    octocrab: Octocrab,
    organizations: Vec<String>,
    clock: Arc<dyn TimeProvider>,
}

impl GitHubLister {
    pub fn new(config: &GitHubConfig, clock: Arc<dyn TimeProvider>) -> GitHubResult<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = config.resolved_token() {
            builder = builder.personal_token(token);
        }
        if let Some(url) = &config.api_url {
            builder = builder.base_uri(url.as_str()).map_err(|e| GitHubError::Client {
                message: format!("invalid api_url '{}': {}", url, e),
            })?;
        }
        Ok(Self {
            octocrab: builder.build()?,
            organizations: config.organizations.clone(),
            clock,
        })
    }

    async fn first_page(&self, organization: Option<&str>) -> GitHubResult<Page<ApiRepository>> {
        let page = match organization {
            Some(org) => {
                self.octocrab
                    .orgs(org)
                    .list_repos()
                    .per_page(PER_PAGE)
                    .send()
                    .await?
            }
            None => {
                self.octocrab
                    .current()
                    .list_repos_for_authenticated_user()
                    .per_page(PER_PAGE)
                    .send()
                    .await?
            }
        };
        Ok(page)
    }

    async fn collect(&self, organization: Option<&str>) -> GitHubResult<Vec<RemoteRepository>> {
        rate_limit::ensure_core_rate_limit(&self.octocrab, self.clock.as_ref()).await?;
        let mut page = self.first_page(organization).await?;
        let mut repositories: Vec<RemoteRepository> =
            page.items.iter().filter_map(convert).collect();

        while page.next.is_some() {
            rate_limit::ensure_core_rate_limit(&self.octocrab, self.clock.as_ref()).await?;
            match self.octocrab.get_page::<ApiRepository>(&page.next).await? {
                Some(next) => {
                    repositories.extend(next.items.iter().filter_map(convert));
                    page = next;
                }
                None => break,
            }
        }
        Ok(repositories)
    }
}

fn convert(repo: &ApiRepository) -> Option<RemoteRepository> {
    let owner = repo.owner.as_ref().map(|o| o.login.clone());
    match (owner, repo.ssh_url.clone()) {
        (Some(owner), Some(ssh_url)) => Some(RemoteRepository {
            owner,
            name: repo.name.clone(),
            ssh_url,
            private: repo.private.unwrap_or(false),
            default_branch: repo
                .default_branch
                .clone()
                .unwrap_or_else(|| "main".to_string()),
        }),
        _ => {
            log::warn!("Skipping repository '{}' without owner or ssh url", repo.name);
            None
        }
    }
}

#[async_trait]
impl RepositoryLister for GitHubLister {
    async fn list_repositories(&self) -> GitHubResult<Vec<RemoteRepository>> {
        if self.organizations.is_empty() {
            return self.collect(None).await;
        }
        let mut all = Vec::new();
        for org in &self.organizations {
            let repos = self.collect(Some(org)).await?;
            log::debug!("Listed {} repositories for {}", repos.len(), org);
            all.extend(repos);
        }
        Ok(all)
    }
}

/// Lister over a list held in memory, replaceable at runtime
#[derive(Debug)]
pub struct StaticLister {
    state: Mutex<Result<Vec<RemoteRepository>, String>>,
}

impl StaticLister {
    pub fn new(repositories: Vec<RemoteRepository>) -> Self {
        Self {
            state: Mutex::new(Ok(repositories)),
        }
    }

    pub fn set(&self, repositories: Vec<RemoteRepository>) {
        *recover_poison(self.state.lock()) = Ok(repositories);
    }

    /// Make subsequent listings fail with `message`
    pub fn fail_with(&self, message: &str) {
        *recover_poison(self.state.lock()) = Err(message.to_string());
    }
}

impl Default for StaticLister {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl RepositoryLister for StaticLister {
    async fn list_repositories(&self) -> GitHubResult<Vec<RemoteRepository>> {
        recover_poison(self.state.lock())
            .clone()
            .map_err(|message| GitHubError::Unavailable { message })
    }
}
