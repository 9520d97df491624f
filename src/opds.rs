//! OPDS 2 catalog generation.

use crate::db::Publication as StoredPublication;
use crate::entitlement::{LicenseStatus, ShelfEntry};
use crate::lcp::LICENSE_MIME;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// OPDS 2 feed media type.
pub const OPDS_MIME: &str = "application/opds+json";
/// OPDS 2 publication media type.
pub const OPDS_PUBLICATION_MIME: &str = "application/opds-publication+json";
/// OPDS authentication document media type.
pub const OPDS_AUTH_MIME: &str = "application/opds-authentication+json";

const REL_ACQUISITION: &str = "http://opds-spec.org/acquisition";
const REL_BORROW: &str = "http://opds-spec.org/acquisition/borrow";
const REL_SHELF: &str = "http://opds-spec.org/shelf";

/// OPDS link.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Link {
    /// Link relation.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rel: String,
    /// Target URL.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub href: String,
    /// Media type of the target.
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub link_type: String,
    /// Nested links (indirect acquisition chains).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub child: Vec<Link>,
    /// Acquisition properties.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
}

impl Link {
    fn new(rel: &str, href: String, link_type: &str) -> Self {
        Self {
            rel: rel.to_string(),
            href,
            link_type: link_type.to_string(),
            ..Self::default()
        }
    }
}

/// Availability of a publication for the requesting user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Availability {
    /// `available`, or the license status once acquired.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    /// Start of the license validity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// End of the license validity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

/// Acquisition link properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Properties {
    /// Availability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<Availability>,
    /// What the reading app ends up with.
    #[serde(rename = "indirectAcquisition", skip_serializing_if = "Vec::is_empty")]
    pub indirect_acquisition: Vec<Link>,
    /// User passphrase hash, lets reading apps open the license silently.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub lcp_hashed_passphrase: String,
}

/// Publication metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    /// Schema.org type.
    #[serde(rename = "@type")]
    pub schema_type: String,
    /// Title.
    pub title: String,
    /// Publication UUID.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub identifier: String,
    /// Publication date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Cover image.
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    /// Image URL.
    pub href: String,
    /// Media type.
    #[serde(rename = "type")]
    pub image_type: String,
}

/// OPDS 2 publication.
#[derive(Debug, Clone, Serialize)]
pub struct Publication {
    /// Metadata.
    pub metadata: Metadata,
    /// Links, including the acquisition link.
    pub links: Vec<Link>,
    /// Cover images.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
}

/// Feed metadata.
#[derive(Debug, Clone, Serialize)]
pub struct FeedMetadata {
    /// Feed title.
    pub title: String,
}

/// OPDS 2 feed.
#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    /// Metadata.
    pub metadata: FeedMetadata,
    /// Navigation links.
    pub links: Vec<Link>,
    /// Publications.
    pub publications: Vec<Publication>,
}

/// Which acquisition link a publication gets.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionChoice<'a> {
    /// Anonymous visitor: borrowing goes through authentication first.
    Anonymous,
    /// Authenticated, no license held: borrow directly.
    Authenticated,
    /// License held: link to the fresh license with its status.
    Entitled {
        /// Current license status.
        status: &'a LicenseStatus,
        /// User passphrase hash.
        hashed_passphrase: &'a str,
    },
}

fn lcp_indirect_acquisition(content_type: &str) -> Vec<Link> {
    vec![Link {
        link_type: LICENSE_MIME.to_string(),
        child: vec![Link {
            link_type: content_type.to_string(),
            ..Link::default()
        }],
        ..Link::default()
    }]
}

fn available() -> Option<Availability> {
    Some(Availability {
        state: "available".to_string(),
        ..Availability::default()
    })
}

/// Feed and link builder. The public base URL is injected once.
#[derive(Debug, Clone)]
pub struct FeedBuilder {
    base_url: String,
    title: String,
}

impl FeedBuilder {
    /// Create a builder for links rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            title: title.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn publication_url(&self, id: &str, action: &str) -> String {
        let id = urlencoding::encode(id);
        if action.is_empty() {
            self.url(&format!("/opds/publication/{}", id))
        } else {
            self.url(&format!("/opds/publication/{}/{}", id, action))
        }
    }

    /// Acquisition link for the given state.
    pub fn acquisition_link(
        &self,
        publication: &StoredPublication,
        choice: &AcquisitionChoice<'_>,
    ) -> Link {
        let indirect_acquisition = lcp_indirect_acquisition(&publication.content_type);
        match choice {
            AcquisitionChoice::Anonymous => Link {
                properties: Some(Properties {
                    availability: available(),
                    indirect_acquisition,
                    ..Properties::default()
                }),
                ..Link::new(
                    REL_BORROW,
                    self.publication_url(&publication.id, "borrow"),
                    OPDS_PUBLICATION_MIME,
                )
            },
            AcquisitionChoice::Authenticated => Link {
                properties: Some(Properties {
                    availability: available(),
                    indirect_acquisition,
                    ..Properties::default()
                }),
                ..Link::new(
                    REL_BORROW,
                    self.publication_url(&publication.id, "loan"),
                    LICENSE_MIME,
                )
            },
            AcquisitionChoice::Entitled {
                status,
                hashed_passphrase,
            } => Link {
                properties: Some(Properties {
                    availability: Some(Availability {
                        state: status.status_code.clone(),
                        since: status.rights.start,
                        until: status.rights.end,
                    }),
                    indirect_acquisition,
                    lcp_hashed_passphrase: hashed_passphrase.to_string(),
                }),
                ..Link::new(
                    REL_ACQUISITION,
                    self.publication_url(&publication.id, "license"),
                    LICENSE_MIME,
                )
            },
        }
    }

    /// OPDS publication without acquisition link.
    pub fn publication(&self, publication: &StoredPublication) -> Publication {
        Publication {
            metadata: Metadata {
                schema_type: "http://schema.org/Book".to_string(),
                title: publication.title.clone(),
                identifier: publication.id.clone(),
                published: publication.date_published.clone(),
                description: publication.description.clone(),
            },
            links: vec![Link::new(
                "self",
                self.publication_url(&publication.id, ""),
                OPDS_PUBLICATION_MIME,
            )],
            images: publication
                .cover_url
                .iter()
                .filter(|url| !url.is_empty())
                .map(|url| Image {
                    href: url.clone(),
                    image_type: "image/jpeg".to_string(),
                })
                .collect(),
        }
    }

    /// OPDS publication with the acquisition link matching `choice`.
    pub fn acquirable_publication(
        &self,
        publication: &StoredPublication,
        choice: &AcquisitionChoice<'_>,
    ) -> Publication {
        let mut entry = self.publication(publication);
        entry.links.push(self.acquisition_link(publication, choice));
        entry
    }

    /// Full catalog.
    pub fn catalog(&self, publications: &[StoredPublication]) -> Feed {
        Feed {
            metadata: FeedMetadata {
                title: self.title.clone(),
            },
            links: vec![
                Link::new("self", self.url("/opds/catalog"), OPDS_MIME),
                Link::new(REL_SHELF, self.url("/opds/bookshelf"), OPDS_MIME),
            ],
            publications: publications.iter().map(|p| self.publication(p)).collect(),
        }
    }

    /// Personal bookshelf, one publication per held license.
    pub fn bookshelf(&self, entries: &[ShelfEntry]) -> Feed {
        Feed {
            metadata: FeedMetadata {
                title: "Bookshelf".to_string(),
            },
            links: vec![
                Link::new("self", self.url("/opds/bookshelf"), OPDS_MIME),
                Link::new("start", self.url("/opds/catalog"), OPDS_MIME),
            ],
            publications: entries
                .iter()
                .map(|entry| {
                    self.acquirable_publication(
                        &entry.detail.publication,
                        &AcquisitionChoice::Entitled {
                            status: &entry.status,
                            hashed_passphrase: &entry.detail.user.hashed_passphrase,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Authentication document returned with 401 answers.
    pub fn authentication_document(&self) -> serde_json::Value {
        serde_json::json!({
            "id": format!("{}/opds/auth", self.base_url),
            "title": self.title,
            "description": "Log in to borrow publications",
            "authentication": [{
                "type": "http://opds-spec.org/auth/oauth/password",
                "links": [{
                    "rel": "authenticate",
                    "href": self.url("/opds/token"),
                    "type": "application/json"
                }]
            }]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lcp::Rights;
    use chrono::TimeZone;

    fn stored() -> StoredPublication {
        StoredPublication {
            id: "pub-1".to_string(),
            title: "Moby Dick".to_string(),
            content_type: "application/epub+zip".to_string(),
            date_published: Some("1851".to_string()),
            description: None,
            cover_url: Some("https://example.com/cover.jpg".to_string()),
            created_at: 0,
        }
    }

    #[test]
    fn anonymous_link_goes_through_borrow() {
        let builder = FeedBuilder::new("http://store/", "Store");
        let link = builder.acquisition_link(&stored(), &AcquisitionChoice::Anonymous);
        assert_eq!(link.href, "http://store/opds/publication/pub-1/borrow");
        assert_eq!(link.rel, REL_BORROW);
        assert_eq!(link.link_type, OPDS_PUBLICATION_MIME);

        let json = serde_json::to_value(&link).unwrap();
        assert_eq!(json["properties"]["availability"]["state"], "available");
        assert_eq!(
            json["properties"]["indirectAcquisition"][0]["type"],
            LICENSE_MIME
        );
        assert_eq!(
            json["properties"]["indirectAcquisition"][0]["child"][0]["type"],
            "application/epub+zip"
        );
        assert!(json["properties"].get("lcp_hashed_passphrase").is_none());
    }

    #[test]
    fn authenticated_link_loans_directly() {
        let builder = FeedBuilder::new("http://store", "Store");
        let link = builder.acquisition_link(&stored(), &AcquisitionChoice::Authenticated);
        assert_eq!(link.href, "http://store/opds/publication/pub-1/loan");
        assert_eq!(link.link_type, LICENSE_MIME);
    }

    #[test]
    fn entitled_link_carries_status_and_passphrase() {
        let builder = FeedBuilder::new("http://store", "Store");
        let status = LicenseStatus {
            status_code: "active".to_string(),
            rights: Rights {
                start: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                end: Some(Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap()),
                ..Rights::default()
            },
            ..LicenseStatus::default()
        };
        let link = builder.acquisition_link(
            &stored(),
            &AcquisitionChoice::Entitled {
                status: &status,
                hashed_passphrase: "abcd",
            },
        );
        assert_eq!(link.rel, REL_ACQUISITION);
        assert_eq!(link.href, "http://store/opds/publication/pub-1/license");

        let json = serde_json::to_value(&link).unwrap();
        let props = &json["properties"];
        assert_eq!(props["lcp_hashed_passphrase"], "abcd");
        assert_eq!(props["availability"]["state"], "active");
        assert_eq!(props["availability"]["since"], "2024-01-01T00:00:00Z");
        assert_eq!(props["availability"]["until"], "2024-01-08T00:00:00Z");
    }

    #[test]
    fn catalog_lists_publications_with_shelf_link() {
        let builder = FeedBuilder::new("http://store", "Store");
        let feed = serde_json::to_value(builder.catalog(&[stored()])).unwrap();
        assert_eq!(feed["metadata"]["title"], "Store");
        assert_eq!(feed["links"][1]["rel"], REL_SHELF);
        assert_eq!(feed["publications"][0]["metadata"]["identifier"], "pub-1");
        assert_eq!(feed["publications"][0]["metadata"]["@type"], "http://schema.org/Book");
        assert_eq!(
            feed["publications"][0]["images"][0]["href"],
            "https://example.com/cover.jpg"
        );
    }
}
