//! Genetic Blending
//!
//! Produces a child agent record from two parents. Contribution weights
//! come from accumulated survival time (longer-lived parents contribute
//! more), numeric traits are averaged, categorical and boolean traits are
//! weighted picks, and bounded mutation is injected per trait. The
//! algorithm is a pure function of its inputs plus a supplied random
//! source, so tests can seed it.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{AgentRecord, KnowledgeEntry, TraitGene, TraitValue};

use super::ancestry::share_prefix;
use super::identity::identity_of;

/// Blending parameters. Defaults match the canonical rule set.
#[derive(Clone, Debug)]
pub struct BlendConfig {
    /// Per-trait mutation probability.
    pub mutation_rate: f64,
    /// Numeric mutation draws a factor from `[1 - m, 1 + m]`.
    pub mutation_magnitude: f64,
    /// Confidence decay applied to every surviving knowledge entry.
    pub confidence_decay: f64,
    /// Knowledge base cap after the merge.
    pub knowledge_cap: usize,
    /// Identity prefix length (hex chars) for the offline relatedness check.
    pub relatedness_prefix_len: usize,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            mutation_rate: 0.05,
            mutation_magnitude: 0.20,
            confidence_decay: 0.95,
            knowledge_cap: 1000,
            relatedness_prefix_len: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum BlendError {
    #[error("parents {a} and {b} are judged related; breeding rejected")]
    RelatedParents { a: String, b: String },
    #[error("negative survival duration: {0}")]
    NegativeSurvival(f64),
}

/// A recorded trait mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub trait_name: String,
    pub before: String,
    pub after: String,
    pub magnitude: f64,
}

/// Result of a blend: the child record plus the evidence of how it was made.
#[derive(Clone, Debug)]
pub struct BlendOutcome {
    pub child: AgentRecord,
    pub weight_a: f64,
    pub weight_b: f64,
    pub mutations: Vec<MutationEvent>,
}

/// Contribution weights from accumulated survival durations.
///
/// `weight_a = a / (a + b)`; 0.5/0.5 when both are zero. The weights sum
/// to exactly 1. Negative durations are an error, not a clamp.
pub fn contribution_weights(survival_a: f64, survival_b: f64) -> Result<(f64, f64), BlendError> {
    if survival_a < 0.0 {
        return Err(BlendError::NegativeSurvival(survival_a));
    }
    if survival_b < 0.0 {
        return Err(BlendError::NegativeSurvival(survival_b));
    }
    let total = survival_a + survival_b;
    if total == 0.0 {
        return Ok((0.5, 0.5));
    }
    let weight_a = survival_a / total;
    Ok((weight_a, 1.0 - weight_a))
}

/// Blend two parent records into a child.
///
/// Rejects pairs whose identities share a fixed-length hex prefix (the
/// offline relatedness fallback; the registry-backed ancestry check is
/// the caller's responsibility). The child's gene hash is recomputed from
/// the blended record set, never inherited.
pub fn blend<R: Rng>(
    parent_a: &AgentRecord,
    parent_b: &AgentRecord,
    survival_a: f64,
    survival_b: f64,
    cfg: &BlendConfig,
    rng: &mut R,
) -> Result<BlendOutcome, BlendError> {
    let id_a = &parent_a.identity.gene_hash;
    let id_b = &parent_b.identity.gene_hash;

    if share_prefix(id_a, id_b, cfg.relatedness_prefix_len) {
        return Err(BlendError::RelatedParents {
            a: id_a.clone(),
            b: id_b.clone(),
        });
    }

    let (weight_a, weight_b) = contribution_weights(survival_a, survival_b)?;
    debug!(
        "Blending {} (w={:.3}) with {} (w={:.3})",
        id_a, weight_a, id_b, weight_b
    );

    let mut mutations: Vec<MutationEvent> = Vec::new();
    let traits = blend_traits(
        &parent_a.traits,
        &parent_b.traits,
        weight_a,
        cfg,
        rng,
        &mut mutations,
    );

    let knowledge = merge_knowledge(&parent_a.knowledge, &parent_b.knowledge, cfg);

    let heavier = if weight_a >= weight_b { parent_a } else { parent_b };
    let mut declared_values = parent_a.identity.declared_values.clone();
    for v in &parent_b.identity.declared_values {
        if !declared_values.contains(v) {
            declared_values.push(v.clone());
        }
    }

    let mut child = AgentRecord {
        identity: crate::types::IdentityMetadata {
            gene_hash: String::new(),
            origin: "bred".to_string(),
            purpose: heavier.identity.purpose.clone(),
            declared_values,
            generation: parent_a
                .identity
                .generation
                .max(parent_b.identity.generation)
                + 1,
            parents: vec![id_a.clone(), id_b.clone()],
            born_at: Utc::now().to_rfc3339(),
        },
        traits,
        knowledge,
        history: Vec::new(),
    };

    child.identity.gene_hash = identity_of(&child);

    info!(
        "Bred child {} (generation {}, {} mutations)",
        child.identity.gene_hash,
        child.identity.generation,
        mutations.len()
    );

    Ok(BlendOutcome {
        child,
        weight_a,
        weight_b,
        mutations,
    })
}

/// Blend the two trait vectors. Traits are matched by name; a trait
/// present in only one parent carries over unchanged.
fn blend_traits<R: Rng>(
    traits_a: &[TraitGene],
    traits_b: &[TraitGene],
    weight_a: f64,
    cfg: &BlendConfig,
    rng: &mut R,
    mutations: &mut Vec<MutationEvent>,
) -> Vec<TraitGene> {
    let mut out: Vec<TraitGene> = Vec::new();

    for ta in traits_a {
        match traits_b.iter().find(|tb| tb.name == ta.name) {
            Some(tb) => {
                let value =
                    blend_trait_value(&ta.name, &ta.value, &tb.value, weight_a, cfg, rng, mutations);
                out.push(TraitGene {
                    name: ta.name.clone(),
                    value,
                });
            }
            None => out.push(ta.clone()),
        }
    }

    for tb in traits_b {
        if !traits_a.iter().any(|ta| ta.name == tb.name) {
            out.push(tb.clone());
        }
    }

    out
}

fn blend_trait_value<R: Rng>(
    name: &str,
    a: &TraitValue,
    b: &TraitValue,
    weight_a: f64,
    cfg: &BlendConfig,
    rng: &mut R,
    mutations: &mut Vec<MutationEvent>,
) -> TraitValue {
    match (a, b) {
        (TraitValue::Numeric { value: va }, TraitValue::Numeric { value: vb }) => {
            let blended = va * weight_a + vb * (1.0 - weight_a);
            let mut value = blended;
            if rng.gen_bool(cfg.mutation_rate) {
                let factor =
                    rng.gen_range(1.0 - cfg.mutation_magnitude..=1.0 + cfg.mutation_magnitude);
                value = (blended * factor).clamp(0.0, 1.0);
                mutations.push(MutationEvent {
                    trait_name: name.to_string(),
                    before: format!("{blended}"),
                    after: format!("{value}"),
                    magnitude: factor - 1.0,
                });
            }
            TraitValue::Numeric { value }
        }
        (
            TraitValue::Categorical {
                value: va,
                options: oa,
            },
            TraitValue::Categorical {
                value: vb,
                options: ob,
            },
        ) => {
            let mut options = oa.clone();
            for o in ob {
                if !options.contains(o) {
                    options.push(o.clone());
                }
            }
            let picked = if rng.gen_bool(weight_a) { va } else { vb };
            let mut value = picked.clone();
            if !options.is_empty() && rng.gen_bool(cfg.mutation_rate) {
                let replacement = options[rng.gen_range(0..options.len())].clone();
                if replacement != value {
                    mutations.push(MutationEvent {
                        trait_name: name.to_string(),
                        before: value.clone(),
                        after: replacement.clone(),
                        magnitude: 1.0,
                    });
                }
                value = replacement;
            }
            TraitValue::Categorical { value, options }
        }
        (TraitValue::Boolean { value: va }, TraitValue::Boolean { value: vb }) => {
            // Weighted coin-flip, no mutation defined for booleans.
            let value = if rng.gen_bool(weight_a) { *va } else { *vb };
            TraitValue::Boolean { value }
        }
        // Mismatched kinds under the same name: keep the dominant parent's gene.
        _ => {
            if weight_a >= 0.5 {
                a.clone()
            } else {
                b.clone()
            }
        }
    }
}

/// Union the two knowledge bases, de-duplicated by (source, content
/// prefix), decay every surviving entry's confidence, sort by confidence
/// descending, and truncate to the cap.
fn merge_knowledge(
    know_a: &[KnowledgeEntry],
    know_b: &[KnowledgeEntry],
    cfg: &BlendConfig,
) -> Vec<KnowledgeEntry> {
    const DEDUP_PREFIX_CHARS: usize = 64;

    let mut merged: Vec<KnowledgeEntry> = Vec::new();
    let mut seen: Vec<(String, String)> = Vec::new();

    for entry in know_a.iter().chain(know_b.iter()) {
        let prefix: String = entry.content.chars().take(DEDUP_PREFIX_CHARS).collect();
        let key = (entry.source.clone(), prefix);
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);

        let mut surviving = entry.clone();
        surviving.confidence *= cfg.confidence_decay;
        merged.push(surviving);
    }

    merged.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(cfg.knowledge_cap);
    merged
}
