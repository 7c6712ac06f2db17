//! In-memory prompt template catalog with deterministic, cached selection.
//!
//! Selection is a pure function of (avatar, mix, k, seed): the per-tier
//! counts come from largest-remainder rounding, niche matches are preferred
//! inside each tier, and ties break on stable template ids. A bounded LRU
//! cache keyed by the full argument tuple accelerates repeated calls.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use lru::LruCache;
use serde_derive::{Deserialize, Serialize};
use crate::data_structures::{Avatar, Tier, TierMix};

const CACHE_CAPACITY: usize = 128;

/// Knobs a template may override on top of the avatar's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateKnobs {
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub niche: String,
    pub tier: Tier,
    pub prompt: String,
    #[serde(default)]
    pub knobs: TemplateKnobs,
}

impl Template {
    fn new(id: &str, niche: &str, tier: Tier, prompt: &str) -> Self {
        Template {
            id: id.to_string(),
            niche: niche.to_string(),
            tier,
            prompt: prompt.to_string(),
            knobs: TemplateKnobs::default(),
        }
    }

    /// Substitute the avatar-specific placeholders into the prompt text.
    pub fn render(&self, avatar: &Avatar) -> String {
        self.prompt
            .replace("{trigger_token}", &avatar.trigger_token)
            .replace("{niche}", &avatar.niche)
    }
}

/// Largest-remainder rounding of `k * mix` into integer per-tier counts that
/// sum to exactly `k`.
pub fn largest_remainder_counts(mix: &TierMix, k: usize) -> [(Tier, usize); 3] {
    let ratios = mix.ratios();
    let mut counts: Vec<(Tier, usize, f64)> = ratios
        .iter()
        .map(|(tier, ratio)| {
            let exact = ratio * k as f64;
            let floor = exact.floor() as usize;
            (*tier, floor, exact - exact.floor())
        })
        .collect();

    let assigned: usize = counts.iter().map(|(_, floor, _)| floor).sum();
    let mut leftover = k.saturating_sub(assigned);

    // Hand the leftover units to the largest remainders; ties go to the
    // lower tier so results are stable.
    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by(|&a, &b| {
        counts[b].2
            .partial_cmp(&counts[a].2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    for idx in order {
        if leftover == 0 {
            break;
        }
        counts[idx].1 += 1;
        leftover -= 1;
    }

    [
        (counts[0].0, counts[0].1),
        (counts[1].0, counts[1].1),
        (counts[2].0, counts[2].1),
    ]
}

// SplitMix64. Selection needs a deterministic sequence from a caller seed;
// the statistical quality bar is low.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemplateFilters {
    pub niche: Option<String>,
    pub tier: Option<Tier>,
}

type SelectionKey = (String, [u64; 3], usize, u64);

pub struct TemplateLibrary {
    catalog: Vec<Template>,
    cache: Mutex<LruCache<SelectionKey, Vec<Template>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TemplateLibrary {
    pub fn new(catalog: Vec<Template>) -> Self {
        TemplateLibrary {
            catalog,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_catalog())
    }

    pub fn get(&self, id: &str) -> Option<&Template> {
        self.catalog.iter().find(|t| t.id == id)
    }

    pub fn list(&self, filters: &TemplateFilters) -> Vec<Template> {
        self.catalog
            .iter()
            .filter(|t| filters.niche.as_deref().map_or(true, |n| t.niche == n))
            .filter(|t| filters.tier.map_or(true, |tier| t.tier == tier))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Select `k` templates for an avatar. Deterministic for a given
    /// (avatar_id, mix, k, seed) tuple; the cache key carries the seed so
    /// different seeds never collapse to one entry.
    pub fn select(&self, avatar: &Avatar, mix: &TierMix, k: usize, seed: u64) -> Vec<Template> {
        let key: SelectionKey = (
            avatar.id.clone(),
            [mix.t1.to_bits(), mix.t2.to_bits(), mix.t3.to_bits()],
            k,
            seed,
        );

        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return cached.clone();
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let selected = select_from_catalog(&self.catalog, &avatar.niche, mix, k, seed);
        self.cache.lock().unwrap().put(key, selected.clone());
        selected
    }
}

/// The pure selection function. Per tier, niche matches are used up before
/// any other template is considered; both groups are sorted by id and a
/// seeded rotation picks the starting offset, cycling when `k` exceeds the
/// pool.
pub fn select_from_catalog(
    catalog: &[Template],
    niche: &str,
    mix: &TierMix,
    k: usize,
    seed: u64,
) -> Vec<Template> {
    let counts = largest_remainder_counts(mix, k);
    let mut rng_state = seed ^ 0xa076_1d64_78bd_642f;
    let mut out = Vec::with_capacity(k);

    for (tier, count) in counts {
        if count == 0 {
            continue;
        }
        let mut matches: Vec<&Template> = catalog
            .iter()
            .filter(|t| t.tier == tier && t.niche == niche)
            .collect();
        let mut others: Vec<&Template> = catalog
            .iter()
            .filter(|t| t.tier == tier && t.niche != niche)
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        others.sort_by(|a, b| a.id.cmp(&b.id));
        if matches.is_empty() && others.is_empty() {
            continue;
        }

        let roll = splitmix64(&mut rng_state) as usize;
        let mut picked: Vec<Template> = Vec::with_capacity(count);
        if !matches.is_empty() {
            let start = roll % matches.len();
            for i in 0..count.min(matches.len()) {
                picked.push(matches[(start + i) % matches.len()].clone());
            }
        }
        if picked.len() < count && !others.is_empty() {
            let needed = count - picked.len();
            let start = roll % others.len();
            for i in 0..needed {
                picked.push(others[(start + i) % others.len()].clone());
            }
        }
        // A tier whose whole catalog is niche matches may still come up
        // short; cycle the matches again.
        let mut wrap = 0;
        while picked.len() < count && !matches.is_empty() {
            picked.push(matches[wrap % matches.len()].clone());
            wrap += 1;
        }
        out.extend(picked);
    }
    out
}

/// Built-in catalog. Ids are stable: selection ordering depends on them.
pub fn builtin_catalog() -> Vec<Template> {
    vec![
        // fitness
        Template::new("fit-t1-01", "fitness", Tier::T1,
            "athletic wear, outdoor morning run, golden hour lighting, candid smile"),
        Template::new("fit-t1-02", "fitness", Tier::T1,
            "gym session, lifting weights, focused expression, dramatic side lighting"),
        Template::new("fit-t1-03", "fitness", Tier::T1,
            "yoga pose on a rooftop terrace, sunrise, serene atmosphere"),
        Template::new("fit-t2-01", "fitness", Tier::T2,
            "post-workout portrait, fitted sportswear, soft studio light, confident pose"),
        Template::new("fit-t2-02", "fitness", Tier::T2,
            "stretching routine in form-fitting athleisure, mirror selfie style"),
        Template::new("fit-t3-01", "fitness", Tier::T3,
            "artistic fitness photoshoot, low-key lighting, sculpted silhouette"),
        // fashion
        Template::new("fash-t1-01", "fashion", Tier::T1,
            "street style outfit, city crosswalk, editorial composition"),
        Template::new("fash-t1-02", "fashion", Tier::T1,
            "autumn lookbook, trench coat, moody overcast light"),
        Template::new("fash-t1-03", "fashion", Tier::T1,
            "cafe terrace, designer sunglasses, candid laugh, 35mm film look"),
        Template::new("fash-t2-01", "fashion", Tier::T2,
            "evening gown, rooftop bar at dusk, glamour lighting"),
        Template::new("fash-t2-02", "fashion", Tier::T2,
            "beach resort editorial, flowing summer dress, golden sand"),
        Template::new("fash-t3-01", "fashion", Tier::T3,
            "high-fashion boudoir editorial, silk and shadow, fine-art styling"),
        // travel
        Template::new("trav-t1-01", "travel", Tier::T1,
            "exploring an old town alley, backpack, warm afternoon light"),
        Template::new("trav-t1-02", "travel", Tier::T1,
            "mountain summit panorama, windbreaker, triumphant pose"),
        Template::new("trav-t2-01", "travel", Tier::T2,
            "infinity pool overlooking the ocean, swimwear, vacation mood"),
        Template::new("trav-t3-01", "travel", Tier::T3,
            "private villa at sunset, artistic poolside portrait, warm tones"),
        // generic fallbacks for any niche
        Template::new("gen-t1-01", "general", Tier::T1,
            "natural portrait, {niche} setting, soft daylight, friendly expression"),
        Template::new("gen-t1-02", "general", Tier::T1,
            "lifestyle candid in a {niche} environment, bokeh background"),
        Template::new("gen-t1-03", "general", Tier::T1,
            "close-up portrait, neutral backdrop, studio softbox lighting"),
        Template::new("gen-t2-01", "general", Tier::T2,
            "glamour portrait themed around {niche}, warm tungsten light"),
        Template::new("gen-t2-02", "general", Tier::T2,
            "elegant evening look, {niche} accents, shallow depth of field"),
        Template::new("gen-t3-01", "general", Tier::T3,
            "fine-art low-light portrait, {niche} motif, dramatic chiaroscuro"),
        Template::new("gen-t3-02", "general", Tier::T3,
            "intimate studio series, sheer fabrics, tasteful shadows"),
    ]
}
