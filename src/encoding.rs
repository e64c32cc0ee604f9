// src/encoding.rs
//
// Accept-Encoding negotiation per RFC 9110 §12.5.3, with two deliberate
// tightenings: duplicate tokens keep their first-seen q-value, and only
// codecs present in the server's advertised preference order are
// candidates.

use crate::config::CompressionConfig;

pub const NB_ENCODINGS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    Identity = 0,
    Gzip = 1,
    Deflate = 2,
    Zstd = 3,
    Brotli = 4,
}

pub const ALL_ENCODINGS: [Encoding; NB_ENCODINGS] = [
    Encoding::Identity,
    Encoding::Gzip,
    Encoding::Deflate,
    Encoding::Zstd,
    Encoding::Brotli,
];

impl Encoding {
    pub fn token(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Zstd => "zstd",
            Encoding::Brotli => "br",
        }
    }

    /// Whether the codec was compiled in.
    pub fn enabled(&self) -> bool {
        match self {
            Encoding::Identity => true,
            Encoding::Gzip | Encoding::Deflate => cfg!(feature = "zlib"),
            Encoding::Zstd => cfg!(feature = "zstd"),
            Encoding::Brotli => cfg!(feature = "brotli"),
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        ALL_ENCODINGS
            .iter()
            .copied()
            .find(|enc| token.eq_ignore_ascii_case(enc.token()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    pub encoding: Option<Encoding>,
    /// The client forbade identity and offered no acceptable alternative:
    /// the response must be 406.
    pub reject: bool,
}

/// Resolves `Accept-Encoding` against the server's preference order.
/// Built once at server construction from the compression config.
#[derive(Debug, Clone)]
pub struct EncodingSelector {
    /// Advertised codecs, most preferred first. Always contains at least
    /// `identity` so an empty header can negotiate cleanly.
    preference: Vec<Encoding>,
    /// Position of each encoding in `preference`, -1 when not advertised.
    pref_index: [i8; NB_ENCODINGS],
}

impl EncodingSelector {
    pub fn new(cfg: &CompressionConfig) -> Self {
        let mut preference = Vec::with_capacity(NB_ENCODINGS);
        if cfg.preferred_formats.is_empty() {
            // Compression codecs first so the default order prefers a real
            // codec over identity on a q tie.
            for enc in [Encoding::Gzip, Encoding::Deflate, Encoding::Zstd, Encoding::Brotli] {
                if enc.enabled() {
                    preference.push(enc);
                }
            }
            preference.push(Encoding::Identity);
        } else {
            for &enc in &cfg.preferred_formats {
                if enc.enabled() && !preference.contains(&enc) {
                    preference.push(enc);
                }
            }
            // The configured list is the full advertised order; only
            // identity is implicitly appended as the universal fallback.
            if !preference.contains(&Encoding::Identity) {
                preference.push(Encoding::Identity);
            }
        }

        let mut pref_index = [-1i8; NB_ENCODINGS];
        for (i, enc) in preference.iter().enumerate() {
            pref_index[*enc as usize] = i as i8;
        }
        Self { preference, pref_index }
    }

    pub fn preference(&self) -> &[Encoding] {
        &self.preference
    }

    fn advertised(&self, enc: Encoding) -> bool {
        self.pref_index[enc as usize] >= 0
    }

    /// Negotiate a content-coding. `None` header means no preference:
    /// identity wins without a 406.
    pub fn negotiate(&self, accept_encoding: Option<&str>) -> Negotiated {
        let header = match accept_encoding {
            Some(h) if !h.trim().is_empty() => h,
            _ => {
                return Negotiated {
                    encoding: Some(Encoding::Identity),
                    reject: false,
                }
            }
        };

        // First occurrence wins; later duplicates never override.
        let mut seen = [false; NB_ENCODINGS];
        let mut q_of = [0.0f64; NB_ENCODINGS];
        let mut wildcard_q: Option<f64> = None;
        let mut identity_explicit = false;

        for raw in header.split(',') {
            let token = raw.trim_matches(|c| c == ' ' || c == '\t');
            if token.is_empty() {
                continue;
            }
            let (name, q) = split_token(token);
            if name == "*" {
                if wildcard_q.is_none() {
                    wildcard_q = Some(q);
                }
                continue;
            }
            if let Some(enc) = Encoding::from_token(name) {
                if enc == Encoding::Identity {
                    identity_explicit = true;
                }
                let idx = enc as usize;
                if !seen[idx] && enc.enabled() {
                    seen[idx] = true;
                    q_of[idx] = q;
                }
            }
        }

        // Highest q wins; ties resolve to the lower server preference
        // index. Only advertised codecs are candidates.
        let mut best: Option<(Encoding, f64, i8)> = None;
        let mut consider = |enc: Encoding, q: f64, pref: i8| {
            if q <= 0.0 {
                return;
            }
            match best {
                Some((_, bq, bp)) if q < bq || (q == bq && pref >= bp) => {}
                _ => best = Some((enc, q, pref)),
            }
        };

        for enc in ALL_ENCODINGS {
            let idx = enc as usize;
            if seen[idx] && self.advertised(enc) {
                consider(enc, q_of[idx], self.pref_index[idx]);
            }
        }
        if let Some(wq) = wildcard_q {
            for &enc in &self.preference {
                if !seen[enc as usize] {
                    consider(enc, wq, self.pref_index[enc as usize]);
                }
            }
        }

        match best {
            Some((enc, _, _)) => Negotiated {
                encoding: Some(enc),
                reject: false,
            },
            None => {
                // Nothing acceptable. Fall back to identity unless the
                // client explicitly shut that door.
                let identity_forbidden = (identity_explicit && q_of[Encoding::Identity as usize] <= 0.0)
                    || (!identity_explicit && wildcard_q.is_some_and(|q| q <= 0.0));
                if identity_forbidden {
                    Negotiated {
                        encoding: None,
                        reject: true,
                    }
                } else {
                    Negotiated {
                        encoding: Some(Encoding::Identity),
                        reject: false,
                    }
                }
            }
        }
    }
}

/// Split one Accept-Encoding element into (name, q). Missing q is 1.0,
/// non-numeric q is 0.0, out-of-range values clamp into [0, 1].
fn split_token(token: &str) -> (&str, f64) {
    let mut parts = token.split(';');
    let name = parts.next().unwrap_or("").trim_matches(|c| c == ' ' || c == '\t');
    let mut q = 1.0f64;
    for param in parts {
        let param = param.trim_matches(|c| c == ' ' || c == '\t');
        if param.len() >= 2 && (param.starts_with('q') || param.starts_with('Q')) && param.as_bytes()[1] == b'=' {
            let val = param[2..].trim_matches(|c| c == ' ' || c == '\t');
            q = val.parse::<f64>().unwrap_or(0.0).clamp(0.0, 1.0);
            break;
        }
    }
    (name, q)
}
