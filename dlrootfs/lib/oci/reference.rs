use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::LazyLock,
};

use getset::Getters;
use oci_spec::image::Digest;
use regex::Regex;

use crate::DlrootfsError;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The namespace of official images, prepended to single-segment repositories.
pub const DEFAULT_REPOSITORY_NAMESPACE: &str = "library";

/// The tag used when none is given.
pub const DEFAULT_TAG: &str = "latest";

/// Registry domains that name Docker Hub and may prefix a reference.
const DOCKER_HUB_DOMAINS: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

static REPOSITORY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .unwrap_or_else(|e| unreachable!("repository pattern is valid: {e}"))
});

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\w[\w.-]{0,127}$").unwrap_or_else(|e| unreachable!("tag pattern is valid: {e}"))
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A Docker Hub image reference: `[docker.io/]<repository>[:<tag>][@<digest>]`.
///
/// Single-segment repositories get the `library/` namespace and a missing tag defaults to
/// `latest`. A digest, when present, wins over the tag when resolving the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageReference {
    /// The repository, namespace included.
    repository: String,

    /// The tag.
    tag: String,

    /// The pinned manifest digest.
    digest: Option<Digest>,
}

/// A `<username>:<password>` pair forwarded to the token endpoint.
#[derive(Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Credentials {
    /// The account name.
    username: String,

    /// The password or access token.
    password: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageReference {
    /// The manifest reference to request: the digest if pinned, else the tag.
    pub fn manifest_reference(&self) -> String {
        match &self.digest {
            Some(digest) => digest.to_string(),
            None => self.tag.clone(),
        }
    }
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for ImageReference {
    type Err = DlrootfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DlrootfsError::InvalidReference("image name is empty".into()));
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                let digest = digest.parse::<Digest>().map_err(|e| {
                    DlrootfsError::InvalidReference(format!("invalid digest {digest}: {e}"))
                })?;
                (name, Some(digest))
            }
            None => (s, None),
        };

        let name = match name.split_once('/') {
            Some((domain, rest)) if DOCKER_HUB_DOMAINS.contains(&domain) => rest,
            Some((domain, _))
                if domain.contains('.') || domain.contains(':') || domain == "localhost" =>
            {
                return Err(DlrootfsError::InvalidReference(format!(
                    "only Docker Hub images are supported, got registry {domain}"
                )));
            }
            _ => name,
        };

        // A ':' after the last '/' separates the tag.
        let (repository, tag) = match name.rfind(':') {
            Some(idx) if !name[idx..].contains('/') => (&name[..idx], &name[idx + 1..]),
            _ => (name, DEFAULT_TAG),
        };

        let repository = if repository.contains('/') {
            repository.to_string()
        } else {
            format!("{DEFAULT_REPOSITORY_NAMESPACE}/{repository}")
        };

        if !REPOSITORY_REGEX.is_match(&repository) {
            return Err(DlrootfsError::InvalidReference(format!(
                "invalid repository: {repository}"
            )));
        }

        if !TAG_REGEX.is_match(tag) {
            return Err(DlrootfsError::InvalidReference(format!("invalid tag: {tag:?}")));
        }

        Ok(Self {
            repository,
            tag: tag.to_string(),
            digest,
        })
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for Credentials {
    type Err = DlrootfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((username, password)) if !username.is_empty() && !password.is_empty() => {
                Ok(Self::new(username, password))
            }
            _ => Err(DlrootfsError::custom(anyhow::anyhow!(
                "credentials must be given as <username>:<password>"
            ))),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_reference_defaults() -> anyhow::Result<()> {
        let reference: ImageReference = "ubuntu".parse()?;
        assert_eq!(reference.get_repository(), "library/ubuntu");
        assert_eq!(reference.get_tag(), DEFAULT_TAG);
        assert_eq!(reference.get_digest(), &None);
        assert_eq!(reference.manifest_reference(), "latest");
        assert_eq!(reference.to_string(), "library/ubuntu:latest");

        let reference: ImageReference = "ubuntu:precise".parse()?;
        assert_eq!(reference.get_repository(), "library/ubuntu");
        assert_eq!(reference.get_tag(), "precise");

        let reference: ImageReference = "dockerfile/elasticsearch:latest".parse()?;
        assert_eq!(reference.get_repository(), "dockerfile/elasticsearch");

        let reference: ImageReference = "docker.io/library/alpine:3.20".parse()?;
        assert_eq!(reference.get_repository(), "library/alpine");
        assert_eq!(reference.get_tag(), "3.20");

        Ok(())
    }

    #[test]
    fn test_image_reference_with_digest() -> anyhow::Result<()> {
        let digest = format!("sha256:{}", "a".repeat(64));
        let reference: ImageReference = format!("alpine:3.20@{digest}").parse()?;

        assert_eq!(reference.get_tag(), "3.20");
        assert_eq!(reference.manifest_reference(), digest);
        assert_eq!(
            reference.to_string(),
            format!("library/alpine:3.20@{digest}")
        );

        Ok(())
    }

    #[test]
    fn test_image_reference_rejects_invalid() {
        for input in ["", "UPPER", "alpine:", "alpine:-bad", "ghcr.io/owner/image", "alpine@nope"] {
            assert!(
                matches!(
                    input.parse::<ImageReference>(),
                    Err(DlrootfsError::InvalidReference(_))
                ),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_credentials_parse() -> anyhow::Result<()> {
        let credentials: Credentials = "user:pa:ss".parse()?;
        assert_eq!(credentials.get_username(), "user");
        assert_eq!(credentials.get_password(), "pa:ss");
        assert!(!format!("{credentials:?}").contains("pa:ss"));

        assert!("user".parse::<Credentials>().is_err());
        assert!(":pass".parse::<Credentials>().is_err());

        Ok(())
    }
}
