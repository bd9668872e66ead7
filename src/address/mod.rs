//! Recipient address parsing and per-domain batching.
//!
//! Addresses split on the **last** `@`: the local part keeps its case, the
//! domain is IDNA-normalised to lowercase ASCII. The original input string
//! is retained verbatim so result maps can key on what the caller passed in.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address '{0}' has no '@' separator")]
    MissingAt(String),
    #[error("address '{0}' has an empty domain")]
    EmptyDomain(String),
    #[error("domain IDNA conversion failed for '{0}'")]
    IdnaConversion(String),
}

/// One parsed recipient. Equality is case-sensitive on the local part and
/// case-insensitive on the domain (the domain is stored lowercased).
#[derive(Debug, Clone)]
pub struct Address {
    /// Local part, case preserved.
    pub local: String,
    /// ASCII domain, lowercased, trailing dot trimmed.
    pub domain: String,
    /// The input string, kept verbatim for result keys.
    pub original: String,
}

impl Address {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let (local, domain) = input
            .rsplit_once('@')
            .ok_or_else(|| AddressError::MissingAt(input.to_string()))?;
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain(input.to_string()));
        }
        let ascii = idna::domain_to_ascii(domain.trim_end_matches('.'))
            .map_err(|_| AddressError::IdnaConversion(domain.to_string()))?;
        if ascii.is_empty() {
            return Err(AddressError::EmptyDomain(input.to_string()));
        }
        Ok(Self {
            local: local.to_string(),
            domain: ascii,
            original: input.to_string(),
        })
    }

    /// `local@domain` with the normalised domain, as written to `RCPT TO`.
    pub fn forward_path(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && self.domain == other.domain
    }
}

impl Eq for Address {}

/// Recipients grouped by domain. Domain order and per-domain recipient
/// order follow first insertion; duplicates are dropped.
#[derive(Debug, Default)]
pub struct DomainBatch {
    groups: Vec<DomainGroup>,
    rejected: Vec<(String, AddressError)>,
}

#[derive(Debug)]
pub struct DomainGroup {
    pub domain: String,
    pub recipients: Vec<Address>,
}

impl DomainBatch {
    pub fn new<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut batch = Self::default();
        for input in inputs {
            batch.insert(input.as_ref());
        }
        batch
    }

    pub fn insert(&mut self, input: &str) {
        let addr = match Address::parse(input) {
            Ok(addr) => addr,
            Err(err) => {
                self.rejected.push((input.to_string(), err));
                return;
            }
        };
        let pos = match self.groups.iter().position(|g| g.domain == addr.domain) {
            Some(pos) => pos,
            None => {
                self.groups.push(DomainGroup {
                    domain: addr.domain.clone(),
                    recipients: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[pos];
        if !group.recipients.contains(&addr) {
            group.recipients.push(addr);
        }
    }

    pub fn groups(&self) -> &[DomainGroup] {
        &self.groups
    }

    /// Inputs that failed to parse, with the reason, in input order.
    pub fn rejected(&self) -> &[(String, AddressError)] {
        &self.rejected
    }

    pub fn recipient_count(&self) -> usize {
        self.groups.iter().map(|g| g.recipients.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
