//! Services compiled into the stock binary. They double as worked
//! examples for writing custom plugins: implement [`Service`], give it a
//! unique name in `spec`, and add it to the table in [`all`].

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use fanout_types::ServiceSpec;

use super::{Service, ServiceResult, SharedService};

pub fn all() -> Vec<SharedService> {
    vec![
        Arc::new(EchoService),
        Arc::new(DigestService),
        Arc::new(ReverseService),
    ]
}

/// Mirrors the request back. Mostly useful for smoke-testing a deployment.
pub struct EchoService;

impl Service for EchoService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: "echo".to_string(),
            description: "Returns the request unchanged".to_string(),
            threads: 2,
            groups: vec!["text".to_string()],
            ..ServiceSpec::default()
        }
    }

    fn run(&self, request: &str) -> ServiceResult<Value> {
        Ok(json!({ "echo": request }))
    }
}

/// SHA-256 of the request bytes, hex encoded.
pub struct DigestService;

impl Service for DigestService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: "sha256".to_string(),
            description: "SHA-256 digest of the request".to_string(),
            threads: 2,
            groups: vec!["text".to_string()],
            allow_batch: true,
            ..ServiceSpec::default()
        }
    }

    fn run(&self, request: &str) -> ServiceResult<Value> {
        let digest = Sha256::digest(request.as_bytes());
        Ok(json!({ "sha256": const_hex::encode(digest) }))
    }

    fn run_list(&self, requests: &[String]) -> ServiceResult<Vec<Value>> {
        requests.iter().map(|request| self.run(request)).collect()
    }
}

pub struct ReverseService;

impl Service for ReverseService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: "reverse".to_string(),
            description: "Reverses the request string".to_string(),
            groups: vec!["text".to_string()],
            ..ServiceSpec::default()
        }
    }

    fn run(&self, request: &str) -> ServiceResult<Value> {
        Ok(json!({ "reversed": request.chars().rev().collect::<String>() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let out = DigestService.run("abc").unwrap();
        assert_eq!(
            out["sha256"],
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn digest_batch_matches_singles() {
        let requests = vec!["a".to_string(), "b".to_string()];
        let batch = DigestService.run_list(&requests).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], DigestService.run("a").unwrap());
    }

    #[test]
    fn builtin_names_are_unique() {
        let mut names: Vec<String> = all().iter().map(|s| s.spec().name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), all().len());
    }
}
