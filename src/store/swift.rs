//! Swift-style HTTP transport
//!
//! [`SwiftClient`] implements [`RemoteClient`] against an object store
//! speaking the Swift API with v1 (header based) authentication:
//!
//! 1. `GET <auth_url>` with `X-Auth-User` and `X-Auth-Key`
//! 2. the response headers carry `X-Storage-Url` and `X-Auth-Token`
//! 3. every further request goes to `<storage_url>/<container>/<object>`
//!    with the token in `X-Auth-Token`
//!
//! Each host backs up into its own container named `<domain>_<hostname>`.
//! The container is created on connect if it does not exist yet.

use crate::config::RemoteConfig;
use crate::error::{Result, VaultError};
use crate::store::remote::{ListQuery, ListedObject, RemoteClient, DIRECTORY_CONTENT_TYPE};
use parking_lot::RwLock;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const AUTH_USER_HEADER: &str = "X-Auth-User";
const AUTH_KEY_HEADER: &str = "X-Auth-Key";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const STORAGE_URL_HEADER: &str = "X-Storage-Url";

/// Authenticated session
#[derive(Debug, Clone)]
struct Session {
    storage_url: Url,
    token: String,
}

/// Entry of a JSON container listing
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingEntry {
    Object {
        name: String,
        bytes: u64,
        hash: String,
        last_modified: String,
        content_type: String,
    },
    Subdir {
        subdir: String,
    },
}

impl From<ListingEntry> for ListedObject {
    fn from(entry: ListingEntry) -> Self {
        match entry {
            ListingEntry::Object {
                name,
                bytes,
                hash,
                last_modified,
                content_type,
            } => ListedObject {
                name,
                bytes,
                hash,
                last_modified,
                content_type,
            },
            ListingEntry::Subdir { subdir } => ListedObject {
                name: subdir,
                content_type: DIRECTORY_CONTENT_TYPE.to_string(),
                ..ListedObject::default()
            },
        }
    }
}

/// Entry of a JSON account listing
#[derive(Debug, Deserialize)]
struct ContainerEntry {
    name: String,
}

/// Blocking HTTP client bound to one container
pub struct SwiftClient {
    http: Client,
    auth_url: String,
    user: String,
    key: String,
    container: String,
    session: RwLock<Session>,
}

impl std::fmt::Debug for SwiftClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwiftClient")
            .field("auth_url", &self.auth_url)
            .field("user", &self.user)
            .field("container", &self.container)
            .finish()
    }
}

impl SwiftClient {
    /// Authenticate and bind to `container`, creating it when absent
    pub fn connect(config: &RemoteConfig, container: impl Into<String>) -> Result<Self> {
        let client = Self::unbound(config, container.into())?;
        client.ensure_container()?;
        Ok(client)
    }

    /// Authenticate without touching any container
    fn unbound(config: &RemoteConfig, container: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VaultError::store(format!("failed to build HTTP client: {}", e)))?;
        let session = authenticate(&http, &config.auth_url, &config.user, &config.key)?;

        Ok(Self {
            http,
            auth_url: config.auth_url.clone(),
            user: config.user.clone(),
            key: config.key.clone(),
            container,
            session: RwLock::new(session),
        })
    }

    /// Container this client reads and writes
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Container name for this machine: `<domain>_<hostname>`
    ///
    /// The short hostname and domain come from the machine's fully qualified
    /// name; an explicit `domain` takes precedence over the discovered one.
    pub fn default_container(domain: Option<&str>) -> Result<String> {
        let fqdn = hostname::get()?
            .into_string()
            .map_err(|_| VaultError::config("hostname is not valid UTF-8"))?;
        container_name(&fqdn, domain)
    }

    /// Find the container holding backups of database node `node`
    ///
    /// Searches the containers of `domain` for one whose root has a
    /// `<node>/` pseudo-directory. Used by restores onto a different host,
    /// where the original hostname is unknown.
    pub fn discover_container(config: &RemoteConfig, domain: &str, node: &str) -> Result<String> {
        let client = Self::unbound(config, String::new())?;
        let wanted = format!("{}/", node.trim_end_matches('/'));

        for container in client.list_containers(&format!("{}_", domain))? {
            let query = ListQuery {
                delimiter: Some('/'),
                limit: usize::MAX,
                ..ListQuery::default()
            };
            let root = client.list_in(&container, &query)?;
            if root.iter().any(|entry| entry.name == wanted) {
                info!("Node {} backups found in container {}", node, container);
                return Ok(container);
            }
        }

        Err(VaultError::NoSnapshot(format!(
            "node {} in any container of domain {}",
            node, domain
        )))
    }

    fn session(&self) -> Session {
        self.session.read().clone()
    }

    /// Build a request for `<storage_url>/<segments...>`
    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let session = self.session();
        let mut url = session.storage_url;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| VaultError::store("storage URL cannot hold a path"))?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/'));
            }
        }
        Ok(self
            .http
            .request(method, url)
            .header(AUTH_TOKEN_HEADER, session.token))
    }

    fn ensure_container(&self) -> Result<()> {
        let response = self.request(Method::HEAD, &[&self.container])?.send()?;
        if response.status() == StatusCode::NOT_FOUND {
            info!("Creating container {}", self.container);
            check(self.request(Method::PUT, &[&self.container])?.send()?, &self.container)?;
        } else {
            check(response, &self.container)?;
            debug!("Using container {}", self.container);
        }
        Ok(())
    }

    fn list_containers(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .request(Method::GET, &[])?
            .query(&[("format", "json"), ("prefix", prefix)])
            .send()?;
        let response = check(response, prefix)?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let containers: Vec<ContainerEntry> = response.json()?;
        Ok(containers.into_iter().map(|entry| entry.name).collect())
    }

    fn list_in(&self, container: &str, query: &ListQuery) -> Result<Vec<ListedObject>> {
        let mut params: Vec<(&str, String)> = vec![("format", "json".to_string())];
        if let Some(prefix) = &query.prefix {
            params.push(("prefix", prefix.clone()));
        }
        if let Some(delimiter) = query.delimiter {
            params.push(("delimiter", delimiter.to_string()));
        }
        if let Some(marker) = &query.marker {
            params.push(("marker", marker.clone()));
        }
        if query.limit != usize::MAX {
            params.push(("limit", query.limit.to_string()));
        }

        let response = self.request(Method::GET, &[container])?.query(&params).send()?;
        let response = check(response, container)?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let entries: Vec<ListingEntry> = response.json()?;
        Ok(entries.into_iter().map(ListedObject::from).collect())
    }
}

impl RemoteClient for SwiftClient {
    fn reconnect(&self) -> Result<()> {
        let session = authenticate(&self.http, &self.auth_url, &self.user, &self.key)?;
        *self.session.write() = session;
        debug!("Re-authenticated against {}", self.auth_url);
        Ok(())
    }

    fn list(&self, query: &ListQuery) -> Result<Vec<ListedObject>> {
        self.list_in(&self.container, query)
    }

    fn get(&self, name: &str, mut sink: &mut dyn Write) -> Result<u64> {
        let response = self.request(Method::GET, &[&self.container, name])?.send()?;
        let mut response = check(response, name)?;
        Ok(response.copy_to(&mut sink)?)
    }

    fn put(&self, name: &str, source: &Path) -> Result<u64> {
        let file = File::open(source)?;
        let len = file.metadata()?.len();
        let response = self
            .request(Method::PUT, &[&self.container, name])?
            .body(file)
            .send()?;
        check(response, name)?;
        Ok(len)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let response = self.request(Method::DELETE, &[&self.container, name])?.send()?;
        check(response, name)?;
        Ok(())
    }
}

/// Obtain a storage URL and token with v1 header authentication
fn authenticate(http: &Client, auth_url: &str, user: &str, key: &str) -> Result<Session> {
    let response = http
        .get(auth_url)
        .header(AUTH_USER_HEADER, user)
        .header(AUTH_KEY_HEADER, key)
        .send()?;
    let response = check(response, auth_url)?;

    let header = |name: &str| -> Result<String> {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| VaultError::store(format!("authentication response lacks {}", name)))
    };
    let storage_url = Url::parse(&header(STORAGE_URL_HEADER)?)
        .map_err(|e| VaultError::store(format!("invalid storage URL: {}", e)))?;
    let token = header(AUTH_TOKEN_HEADER)?;

    debug!("Authenticated as {} with storage URL {}", user, storage_url);
    Ok(Session { storage_url, token })
}

/// Map a response status onto the crate's error taxonomy
fn check(response: Response, name: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(status_error(status, name))
}

fn status_error(status: StatusCode, name: &str) -> VaultError {
    match status {
        StatusCode::NOT_FOUND => VaultError::NotFound(name.to_string()),
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => {
            VaultError::transient(format!("{} for {}", status, name))
        }
        s if s.is_server_error() => VaultError::transient(format!("{} for {}", s, name)),
        s => VaultError::store(format!("{} for {}", s, name)),
    }
}

fn container_name(fqdn: &str, domain: Option<&str>) -> Result<String> {
    let (host, fqdn_domain) = match fqdn.split_once('.') {
        Some((host, domain)) => (host, Some(domain)),
        None => (fqdn, None),
    };
    let domain = domain.or(fqdn_domain).ok_or_else(|| {
        VaultError::config(format!(
            "cannot derive a domain from hostname {:?}; set remote.domain or remote.container",
            fqdn
        ))
    })?;
    Ok(format!("{}_{}", domain, host))
}
