use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::catalog::{Catalog, DocumentRecord, Visibility};
use crate::error::Result;
use crate::principal::Principal;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    Fingerprint(blake3::hash(bytes).to_hex().to_string())
}

pub fn is_visible(doc: &DocumentRecord, principal: &Principal) -> bool {
    principal.is_superuser
        || doc.visibility == Visibility::Public
        || doc.created_by == principal.id
        || doc.authorized_users.iter().any(|u| u == &principal.id)
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateMatches {
    pub all: Vec<DocumentRecord>,
    pub visible: Vec<DocumentRecord>,
    pub invisible: Vec<DocumentRecord>,
}

impl DuplicateMatches {
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    Allow,
    Deny(DocumentRecord),
    GrantAccess(DocumentRecord),
}

impl DedupDecision {
    pub fn message(&self) -> String {
        match self {
            DedupDecision::Allow => "upload accepted".to_string(),
            DedupDecision::Deny(existing) => format!(
                "identical file already exists as {:?} in knowledge base {}",
                existing.name, existing.kb_id
            ),
            DedupDecision::GrantAccess(existing) => format!(
                "identical file {:?} already exists; access has been granted instead of storing a copy",
                existing.name
            ),
        }
    }
}

#[derive(Clone)]
pub struct DedupResolver {
    catalog: Catalog,
}

impl DedupResolver {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    pub fn classify(
        &self,
        digest: &Fingerprint,
        requester: &Principal,
        target_kb: &str,
    ) -> Result<DuplicateMatches> {
        let mut matches = DuplicateMatches::default();
        for doc in self.catalog.find_by_fingerprint(digest.as_str())? {
            if doc.kb_id == target_kb {
                continue;
            }
            if is_visible(&doc, requester) {
                matches.visible.push(doc.clone());
            } else {
                matches.invisible.push(doc.clone());
            }
            matches.all.push(doc);
        }
        Ok(matches)
    }

    pub fn decide(
        &self,
        requester: &Principal,
        digest: &Fingerprint,
        target_kb: &str,
    ) -> Result<DedupDecision> {
        let matches = self.classify(digest, requester, target_kb)?;
        let decision = if requester.is_superuser {
            match matches.all.into_iter().next() {
                Some(existing) => DedupDecision::Deny(existing),
                None => DedupDecision::Allow,
            }
        } else if let Some(existing) = matches.visible.into_iter().next() {
            DedupDecision::Deny(existing)
        } else if let Some(existing) = matches.invisible.into_iter().next() {
            DedupDecision::GrantAccess(existing)
        } else {
            DedupDecision::Allow
        };
        debug!(user = %requester.id, digest = %digest, kb_id = target_kb, decision = decision_kind(&decision), "dedup decided");
        Ok(decision)
    }
}

fn decision_kind(decision: &DedupDecision) -> &'static str {
    match decision {
        DedupDecision::Allow => "allow",
        DedupDecision::Deny(_) => "deny",
        DedupDecision::GrantAccess(_) => "grant_access",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_and_content_addressed() {
        let a = fingerprint(b"quarterly report");
        assert_eq!(a, fingerprint(b"quarterly report"));
        assert_ne!(a, fingerprint(b"quarterly report!"));
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    fn doc(created_by: &str, authorized: &[&str]) -> DocumentRecord {
        DocumentRecord {
            id: "d1".to_string(),
            kb_id: "kb1".to_string(),
            name: "plan.txt".to_string(),
            location: "plan.txt".to_string(),
            size: 1,
            file_type: kb_core::FileType::Doc,
            parser: kb_core::ParserKind::Naive,
            created_by: created_by.to_string(),
            visibility: Visibility::Private,
            fingerprint: "f".to_string(),
            authorized_users: authorized.iter().map(|u| u.to_string()).collect(),
            thumbnail: None,
            token_num: 0,
            chunk_num: 0,
            process_duration: 0.0,
            created_at: 0,
        }
    }

    #[test]
    fn messages_name_the_existing_file() {
        let existing = doc("owner", &[]);
        assert!(DedupDecision::Deny(existing.clone()).message().contains("plan.txt"));
        assert!(DedupDecision::GrantAccess(existing).message().contains("access"));
    }

    #[test]
    fn visibility_rules() {
        let private = doc("owner", &["friend"]);
        assert!(is_visible(&private, &Principal::user("owner")));
        assert!(is_visible(&private, &Principal::user("friend")));
        assert!(is_visible(&private, &Principal::superuser("root")));
        assert!(!is_visible(&private, &Principal::user("other")));
        let public = DocumentRecord {
            visibility: Visibility::Public,
            ..doc("owner", &[])
        };
        assert!(is_visible(&public, &Principal::user("other")));
    }
}
