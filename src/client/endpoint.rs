use rand::{Rng, RngCore};
use reqwest::Method;
use serde_json::{json, Value};

const WORDS: [&str; 12] = [
    "ledger", "agent", "payment", "proof", "receipt", "nonce", "settle", "verify", "route",
    "token", "window", "stream",
];

/// One callable API route and how often agents pick it relative to the others.
#[derive(Clone)]
pub struct Endpoint {
    pub method: Method,
    pub path: String,
    pub weight: f64,
    pub payload: fn(&mut dyn RngCore) -> Value,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub fn post(path: &str, weight: f64) -> Self {
        Self {
            method: Method::POST,
            path: path.to_string(),
            weight,
            payload: random_text,
        }
    }
}

/// `{"text": ...}` made of a few random words.
pub fn random_text(rng: &mut dyn RngCore) -> Value {
    let count = rng.gen_range(1..=6);
    let words: Vec<&str> = (0..count)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect();
    json!({ "text": words.join(" ") })
}

pub fn default_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::post("/api/echo", 40.0),
        Endpoint::post("/api/reverse", 30.0),
        Endpoint::post("/api/uppercase", 20.0),
        Endpoint::post("/api/hash", 10.0),
    ]
}

/// Walks the list subtracting weights from `draw` (taken from `[0, total)`)
/// until it drops to zero or below. Rounding can leave a sliver past the
/// last entry, which then wins.
pub fn pick_weighted(endpoints: &[Endpoint], mut draw: f64) -> Option<&Endpoint> {
    for endpoint in endpoints {
        draw -= endpoint.weight;
        if draw <= 0.0 {
            return Some(endpoint);
        }
    }
    endpoints.last()
}

pub fn select_endpoint<'a, R: Rng + ?Sized>(
    endpoints: &'a [Endpoint],
    rng: &mut R,
) -> Option<&'a Endpoint> {
    let total: f64 = endpoints.iter().map(|e| e.weight).sum();
    if total <= 0.0 {
        return endpoints.first();
    }
    pick_weighted(endpoints, rng.gen_range(0.0..total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_weighted_selection_converges() {
        let endpoints = default_endpoints();
        let mut rng = StdRng::seed_from_u64(402);
        let mut counts = [0usize; 4];
        let draws = 100_000;

        for _ in 0..draws {
            let picked = select_endpoint(&endpoints, &mut rng).unwrap();
            let index = endpoints.iter().position(|e| e.path == picked.path).unwrap();
            counts[index] += 1;
        }

        for (count, expected) in counts.iter().zip([0.40, 0.30, 0.20, 0.10]) {
            let observed = *count as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.02,
                "observed {} expected {}",
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_boundaries() {
        let endpoints = default_endpoints();
        assert_eq!(pick_weighted(&endpoints, 0.0).unwrap().path, "/api/echo");
        assert_eq!(pick_weighted(&endpoints, 40.0).unwrap().path, "/api/echo");
        assert_eq!(pick_weighted(&endpoints, 40.5).unwrap().path, "/api/reverse");
        assert_eq!(pick_weighted(&endpoints, 100.0 + 1e-9).unwrap().path, "/api/hash");
        assert!(pick_weighted(&[], 1.0).is_none());
    }

    #[test]
    fn test_payload_has_text() {
        let mut rng = StdRng::seed_from_u64(1);
        let payload = random_text(&mut rng);
        assert!(!payload["text"].as_str().unwrap().is_empty());
    }
}
