use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CoachError {
    #[error("catalog has no categories")]
    EmptyCatalog,

    #[error("category at position {position} has an empty name")]
    EmptyCategoryName { position: usize },

    #[error("category {name} is defined more than once")]
    DuplicateCategory { name: String },

    #[error("category {category} has no questions")]
    EmptyQuestionBank { category: String },

    #[error("question {index} of category {category} is blank")]
    BlankQuestion { category: String, index: usize },

    #[error("pattern {rule} of category {category} has no trigger words")]
    EmptyTriggers { category: String, rule: usize },

    #[error("pattern {rule} of category {category} has weight 0")]
    InvalidWeight { category: String, rule: usize },

    #[error("failed to read catalog {path}: {source}")]
    CatalogRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    CatalogParse(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub triggers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub questions: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<PatternRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoveredTopic {
    pub category: String,
    pub score: u32,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicScore {
    pub category: String,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityResult {
    pub question: String,
    pub index: usize,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryPill {
    pub category: String,
    pub label: String,
    pub covered: bool,
}

// ---------------------------------------------------------------------------
// Hyperparameters
// ---------------------------------------------------------------------------

struct Hyperparameters {
    context_bonus: u32,
    sentiment_bonus: u32,
    detection_threshold: u32,
    well_covered_min: u32,
    min_sentence_chars: usize,
    completed_sentence_min_words: usize,
    min_token_chars: usize,
    exact_match_score: f64,
    synonym_match_score: f64,
    partial_match_score: f64,
    deletion_ratio: f64,
}

static HP: Hyperparameters = Hyperparameters {
    context_bonus: 2,
    sentiment_bonus: 1,
    detection_threshold: 3,
    well_covered_min: 2,
    min_sentence_chars: 10,
    completed_sentence_min_words: 2,
    min_token_chars: 3,
    exact_match_score: 3.0,
    synonym_match_score: 2.0,
    partial_match_score: 1.0,
    deletion_ratio: 0.5,
};

pub const FALLBACK_QUESTION: &str = "What else would you like to share about your experience?";

// ---------------------------------------------------------------------------
// Compiled patterns and word lists
// ---------------------------------------------------------------------------

static SENTENCE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+").unwrap());

static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());

const POSITIVE_WORDS: &[&str] = &[
    "good",
    "great",
    "excellent",
    "amazing",
    "wonderful",
    "nice",
    "easy",
    "convenient",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad",
    "terrible",
    "awful",
    "horrible",
    "difficult",
    "hard",
    "annoying",
    "disturbing",
];

const SYNONYM_GROUPS: &[&[&str]] = &[
    &["clean", "dirty", "cleanliness", "hygiene", "sanitary", "spotless", "messy", "tidy"],
    &["room", "suite", "bedroom", "accommodation", "space"],
    &["bathroom", "shower", "toilet", "washroom", "restroom"],
    &["staff", "service", "employee", "personnel", "team"],
    &["location", "area", "neighborhood", "vicinity", "position"],
    &["noise", "loud", "quiet", "sound", "noisy", "peaceful"],
    &["good", "great", "excellent", "wonderful", "amazing", "fantastic"],
    &["bad", "terrible", "awful", "disappointing", "poor", "horrible"],
    &["expensive", "cheap", "costly", "affordable", "pricey", "budget"],
    &["comfortable", "cozy", "spacious", "cramped", "tight", "roomy"],
];

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

// ---------------------------------------------------------------------------
// Built-in catalog
// ---------------------------------------------------------------------------

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn rule(triggers: &[&str], context: &[&str], sentiment: Option<Sentiment>, weight: u32) -> PatternRule {
    PatternRule {
        triggers: strings(triggers),
        context: strings(context),
        sentiment,
        weight,
    }
}

fn category(name: &str, keywords: &[&str], questions: &[&str], patterns: Vec<PatternRule>) -> Category {
    Category {
        name: name.to_string(),
        keywords: strings(keywords),
        questions: strings(questions),
        patterns,
    }
}

fn builtin_categories() -> Vec<Category> {
    use Sentiment::{Negative, Positive};

    vec![
        category(
            "LOCATION",
            &[
                "location", "area", "neighborhood", "nearby", "around", "walking", "driving",
                "transit", "transportation", "distance", "close", "far", "convenient",
                "getting to", "getting around",
            ],
            &[
                "What made the location a good fit (or not) for your trip?",
                "How was it getting to the hotel from wherever you came from?",
                "What was it like getting around once you were there \u{2014} walking, driving, or taking transit?",
                "Did anything nearby \u{2014} like restaurants, shops, or parks \u{2014} stand out to you?",
                "How would you describe the area around the hotel?",
                "Did you notice any views, scenery, or setting that added to the experience?",
            ],
            vec![
                rule(
                    &["train", "bus", "subway", "metro"],
                    &["easy", "convenient", "accessible", "close", "able", "quick", "fast"],
                    Some(Positive),
                    4,
                ),
                rule(&["walking", "walk"], &["easy", "convenient", "close", "short", "quick"], Some(Positive), 3),
                rule(&["driving", "drive"], &["easy", "convenient", "accessible", "parking"], Some(Positive), 3),
                rule(&["location", "area", "neighborhood"], &["good", "great", "perfect", "convenient"], Some(Positive), 3),
                rule(&["airport", "station"], &["close", "near", "convenient", "easy"], Some(Positive), 3),
                rule(&["convenience", "convenient"], &["to", "downtown", "city", "center", "area"], Some(Positive), 4),
                rule(&["downtown", "city center", "center"], &["close", "near", "convenient", "easy", "to"], Some(Positive), 3),
                rule(&["getting", "reach", "access"], &["to", "from", "around", "easy", "difficult"], None, 2),
                rule(&["nearby", "around", "close", "distance"], &[], None, 2),
            ],
        ),
        category(
            "ATMOSPHERE",
            &[
                "atmosphere", "vibe", "feel", "impression", "ambiance", "mood", "style", "decor",
                "design", "lobby", "cozy", "spacious", "compact", "open", "elegant", "modern",
                "classic",
            ],
            &[
                "How would you describe the vibe of the hotel during your stay?",
                "What was your first impression when you stepped inside?",
                "Did the place feel more cozy and compact, or big and open?",
                "How would you describe the hotel's style or look?",
                "What was the atmosphere like in shared spaces \u{2014} like the lobby, hallway, or breakfast room?",
                "Did the overall feel of the place affect how you felt about your trip?",
            ],
            vec![
                rule(&["atmosphere", "vibe", "feel"], &[], None, 4),
                rule(&["cozy", "elegant", "modern", "classic"], &[], None, 3),
                rule(&["lobby", "reception"], &["beautiful", "nice", "impressive"], None, 3),
                rule(&["impression", "feeling"], &[], None, 2),
            ],
        ),
        category(
            "CLEANLINESS",
            &[
                "clean", "dirty", "cleanliness", "hygiene", "sanitary", "spotless", "messy",
                "tidy", "maintained", "housekeeping", "fresh", "smell",
            ],
            &[
                "How clean did your room feel during your stay?",
                "What was your experience with the bathroom's cleanliness?",
                "How would you describe the cleanliness of common areas like hallways or dining spaces?",
                "Was there anything about the hotel's cleanliness that stood out \u{2014} good or bad?",
                "How did the level of cleanliness affect your comfort during the trip?",
            ],
            vec![
                rule(&["clean", "spotless", "tidy"], &[], Some(Positive), 4),
                rule(&["dirty", "messy", "filthy"], &[], Some(Negative), 4),
                rule(&["bathroom", "room", "bed"], &["clean", "dirty", "spotless", "messy"], None, 3),
                rule(&["smell", "odor"], &["bad", "terrible", "unpleasant"], Some(Negative), 3),
                rule(&["housekeeping", "cleaning"], &[], None, 2),
            ],
        ),
        category(
            "ROOMS",
            &[
                "room", "bedroom", "suite", "bed", "bathroom", "shower", "furniture", "comfort",
                "space", "size", "layout", "amenities", "view", "window", "balcony",
            ],
            &[
                "How did your room feel overall during your stay?",
                "What stood out to you about the furniture, bed, or overall comfort of the room?",
                "How was the bathroom setup and experience?",
                "Did the room design or style match what you expected from the listing?",
                "Were there any details \u{2014} good or bad \u{2014} that affected how you used the room?",
                "Did your room have any kind of view, or anything worth noticing outside?",
            ],
            vec![
                rule(&["room", "bedroom", "suite"], &["spacious", "comfortable", "cozy", "cramped", "small"], None, 4),
                rule(&["bed", "mattress"], &["comfortable", "soft", "hard", "uncomfortable"], None, 3),
                rule(&["bathroom", "shower"], &["nice", "good", "small", "cramped"], None, 3),
                rule(&["furniture", "decor", "design"], &[], None, 2),
                rule(&["view", "window", "balcony"], &[], None, 2),
            ],
        ),
        category(
            "NOISE",
            &[
                "noise", "loud", "quiet", "sound", "noisy", "peaceful", "street noise", "traffic",
                "neighbors", "music", "construction", "sleep", "disturbing",
            ],
            &[
                "What was the noise like in your room \u{2014} during the day or at night?",
                "Did any specific sounds or sources stand out \u{2014} like street noise, hallway traffic, or hotel facilities?",
                "If someone asked you for a quieter spot in the hotel, is there a floor or area you'd suggest (or avoid)?",
                "How did the noise level affect your sleep or overall comfort?",
            ],
            vec![
                rule(
                    &["train", "traffic", "cars"],
                    &["loud", "noisy", "disruptive", "disturbing", "annoying"],
                    Some(Negative),
                    4,
                ),
                rule(&["noise", "loud", "noisy"], &[], None, 4),
                rule(&["quiet", "peaceful", "silent"], &[], Some(Positive), 3),
                rule(&["sleep", "sleeping"], &["difficult", "hard", "disturbed", "interrupted"], Some(Negative), 3),
                rule(&["night", "evening"], &["loud", "noisy", "disruptive"], Some(Negative), 3),
                rule(&["construction", "music", "party"], &["loud", "disturbing"], Some(Negative), 3),
            ],
        ),
        category(
            "SERVICE",
            &[
                "staff", "service", "employee", "helpful", "friendly", "rude", "professional",
                "check-in", "check-out", "reception", "front desk", "concierge", "housekeeping",
            ],
            &[
                "How would you describe the way staff treated you during your stay?",
                "Were there any moments where staff went out of their way to help you \u{2014} or didn't?",
                "How well did staff handle any questions, requests, or problems you had?",
                "What was your experience like at check-in and check-out?",
            ],
            vec![
                rule(&["staff", "service", "employee"], &[], None, 4),
                rule(&["helpful", "friendly", "rude", "professional"], &["staff", "service"], None, 3),
                rule(&["check-in", "check-out"], &[], None, 3),
                rule(&["reception", "front desk", "concierge"], &[], None, 2),
            ],
        ),
        category(
            "AMENITIES",
            &[
                "pool", "gym", "spa", "restaurant", "bar", "parking", "wifi", "internet",
                "breakfast", "facilities", "amenities", "fitness", "dining", "elevator",
            ],
            &[
                "Did you use any of the hotel's amenities \u{2014} like a pool, gym, restaurant, or parking? What was that like?",
                "Was there anything the hotel offered that really added to your stay?",
                "Were there any amenities you were hoping for that weren't available?",
                "How was the quality or upkeep of the amenities you used?",
                "Did any service or facility make your stay more comfortable or convenient?",
            ],
            vec![
                rule(&["pool", "gym", "spa", "restaurant", "bar"], &[], None, 4),
                rule(&["shuttle", "shuttles"], &[], None, 4),
                rule(&["parking", "wifi", "internet"], &[], None, 3),
                rule(&["breakfast"], &[], None, 3),
                rule(&["amenities", "facilities"], &[], None, 2),
            ],
        ),
        category(
            "VALUE",
            &[
                "price", "cost", "expensive", "cheap", "value", "worth", "money", "budget",
                "affordable", "overpriced", "deal", "fee", "charge",
            ],
            &[
                "Did the stay feel worth what you paid?",
                "Were there any extras \u{2014} included or unexpected \u{2014} that added to the value?",
                "Was there anything that felt overpriced or not quite worth the cost?",
                "If someone had your same budget, would you recommend this hotel? Why or why not?",
            ],
            vec![
                rule(&["price", "cost", "expensive", "cheap"], &[], None, 4),
                rule(&["value", "worth", "money"], &[], None, 3),
                rule(&["budget", "affordable", "overpriced"], &[], None, 3),
                rule(&["deal", "fee", "charge"], &[], None, 2),
            ],
        ),
    ]
}

static BUILTIN_CATALOG: Lazy<Arc<Catalog>> =
    Lazy::new(|| Arc::new(Catalog::new(builtin_categories()).expect("built-in catalog is valid")));

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CatalogFile {
    categories: Vec<Category>,
}

// Category order drives detection output and every "first category" fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    categories: Vec<Category>,
}

fn normalize_words(words: &[String]) -> Vec<String> {
    words
        .iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

impl Catalog {
    pub fn new(categories: Vec<Category>) -> Result<Self, CoachError> {
        if categories.is_empty() {
            return Err(CoachError::EmptyCatalog);
        }

        let mut seen = HashSet::new();
        let mut validated = Vec::with_capacity(categories.len());
        for (position, mut category) in categories.into_iter().enumerate() {
            category.name = category.name.trim().to_string();
            if category.name.is_empty() {
                return Err(CoachError::EmptyCategoryName { position });
            }
            if !seen.insert(category.name.clone()) {
                return Err(CoachError::DuplicateCategory {
                    name: category.name,
                });
            }
            if category.questions.is_empty() {
                return Err(CoachError::EmptyQuestionBank {
                    category: category.name,
                });
            }
            if let Some(index) = category.questions.iter().position(|q| q.trim().is_empty()) {
                return Err(CoachError::BlankQuestion {
                    category: category.name,
                    index,
                });
            }
            for (rule_index, rule) in category.patterns.iter_mut().enumerate() {
                rule.triggers = normalize_words(&rule.triggers);
                rule.context = normalize_words(&rule.context);
                if rule.triggers.is_empty() {
                    return Err(CoachError::EmptyTriggers {
                        category: category.name.clone(),
                        rule: rule_index,
                    });
                }
                if rule.weight == 0 {
                    return Err(CoachError::InvalidWeight {
                        category: category.name.clone(),
                        rule: rule_index,
                    });
                }
            }
            validated.push(category);
        }

        Ok(Self {
            categories: validated,
        })
    }

    pub fn builtin() -> Arc<Catalog> {
        Arc::clone(&BUILTIN_CATALOG)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, CoachError> {
        let file: CatalogFile = toml::from_str(source)?;
        Self::new(file.categories)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoachError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| CoachError::CatalogRead {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_toml_str(&source)?;
        debug!(
            path = %path.display(),
            categories = catalog.categories.len(),
            "loaded catalog"
        );
        Ok(catalog)
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn get(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn list_categories(&self) -> Vec<&str> {
        self.categories.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn questions_for(&self, name: &str) -> &[String] {
        self.get(name).map(|c| c.questions.as_slice()).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Sentence extraction
// ---------------------------------------------------------------------------

/// The most recent sentence of `text`, without its closing terminator.
///
/// A terminator in the final position is treated as the end of that
/// sentence, so "Nice room. Great staff!" yields "Great staff". Text that
/// does not end in punctuation keeps its last character ("Great sta" stays
/// "Great sta"); older form code dropped it unconditionally.
pub fn last_sentence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(last) = trimmed.chars().next_back() else {
        return "";
    };
    let body_end = trimmed.len() - last.len_utf8();
    let end = if is_terminator(last) {
        body_end
    } else {
        trimmed.len()
    };
    let start = trimmed[..body_end]
        .rfind(is_terminator)
        .map(|i| i + 1)
        .unwrap_or(0);
    if start >= end {
        return "";
    }
    trimmed[start..end].trim()
}

pub fn ends_with_completed_sentence(text: &str) -> bool {
    let trimmed = text.trim();
    match trimmed.chars().next_back() {
        Some(c) if is_terminator(c) => {}
        _ => return false,
    }
    last_sentence(trimmed).split_whitespace().count() >= HP.completed_sentence_min_words
}

fn split_sentences(text: &str) -> impl Iterator<Item = &str> {
    SENTENCE_SPLIT_RE
        .split(text)
        .map(str::trim)
        .filter(|s| s.chars().count() >= HP.min_sentence_chars)
}

// ---------------------------------------------------------------------------
// Topic detection
// ---------------------------------------------------------------------------

fn rule_score(rule: &PatternRule, text: &str) -> u32 {
    if !rule.triggers.iter().any(|w| text.contains(w.as_str())) {
        return 0;
    }

    let mut score = rule.weight;
    if rule.context.iter().any(|w| text.contains(w.as_str())) {
        score += HP.context_bonus;
    }
    if let Some(sentiment) = rule.sentiment {
        let words = match sentiment {
            Sentiment::Positive => POSITIVE_WORDS,
            Sentiment::Negative => NEGATIVE_WORDS,
        };
        if words.iter().any(|w| text.contains(w)) {
            score += HP.sentiment_bonus;
        }
    }
    score
}

// `text` must already be lowercased and trimmed.
fn category_score(category: &Category, text: &str) -> u32 {
    let mut total = 0;
    for rule in &category.patterns {
        let score = rule_score(rule, text);
        if score > 0 {
            total += score;
            trace!(
                category = %category.name,
                rule_score = score,
                total,
                "pattern match"
            );
        }
    }
    total
}

fn detect_indices(catalog: &Catalog, text: &str) -> Vec<usize> {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return vec![];
    }

    let detected: Vec<usize> = catalog
        .categories
        .iter()
        .enumerate()
        .filter(|(_, c)| category_score(c, &normalized) >= HP.detection_threshold)
        .map(|(i, _)| i)
        .collect();
    trace!(text = %normalized, detected = detected.len(), "topic detection");
    detected
}

pub fn score_topics(catalog: &Catalog, text: &str) -> Vec<TopicScore> {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return vec![];
    }

    catalog
        .categories
        .iter()
        .filter_map(|c| {
            let score = category_score(c, &normalized);
            (score > 0).then(|| TopicScore {
                category: c.name.clone(),
                score,
            })
        })
        .collect()
}

pub fn detect_topics<'c>(catalog: &'c Catalog, text: &str) -> Vec<&'c str> {
    detect_indices(catalog, text)
        .into_iter()
        .map(|i| catalog.categories[i].name.as_str())
        .collect()
}

// ---------------------------------------------------------------------------
// Coverage analysis
// ---------------------------------------------------------------------------

// Categories never detected are absent, not present with score 0.
pub fn analyze_coverage(catalog: &Catalog, text: &str) -> Vec<CoveredTopic> {
    if text.trim().is_empty() {
        return vec![];
    }

    let mut slots: Vec<Option<CoveredTopic>> = vec![None; catalog.categories.len()];
    for sentence in split_sentences(text) {
        for index in detect_indices(catalog, sentence) {
            let topic = slots[index].get_or_insert_with(|| CoveredTopic {
                category: catalog.categories[index].name.clone(),
                score: 0,
                examples: Vec::new(),
            });
            topic.score += 1;
            topic.examples.push(sentence.to_string());
        }
    }

    let covered: Vec<CoveredTopic> = slots.into_iter().flatten().collect();
    debug!(
        mentions = ?covered
            .iter()
            .map(|t| format!("{}: {}", t.category, t.score))
            .collect::<Vec<_>>(),
        "coverage analysis"
    );
    covered
}

pub fn is_well_covered(category: &str, covered: &[CoveredTopic]) -> bool {
    covered
        .iter()
        .any(|t| t.category == category && t.score >= HP.well_covered_min)
}

pub fn uncovered_categories<'a>(all: &[&'a str], covered: &[CoveredTopic]) -> Vec<&'a str> {
    all.iter()
        .copied()
        .filter(|name| !covered.iter().any(|t| t.category == *name))
        .collect()
}

pub fn lightly_covered_categories<'a>(all: &[&'a str], covered: &[CoveredTopic]) -> Vec<&'a str> {
    all.iter()
        .copied()
        .filter(|name| {
            covered
                .iter()
                .find(|t| t.category == *name)
                .is_some_and(|t| t.score < HP.well_covered_min)
        })
        .collect()
}

pub fn category_label(name: &str) -> String {
    if name == "NOISE" {
        return "Noise level".to_string();
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => {
            let rest = chars.as_str().to_lowercase();
            first.to_uppercase().chain(rest.chars()).collect()
        }
        None => String::new(),
    }
}

fn pills_from_coverage(catalog: &Catalog, covered: &[CoveredTopic]) -> Vec<CategoryPill> {
    catalog
        .categories
        .iter()
        .map(|c| CategoryPill {
            category: c.name.clone(),
            label: category_label(&c.name),
            covered: covered.iter().any(|t| t.category == c.name),
        })
        .collect()
}

pub fn coverage_pills(catalog: &Catalog, text: &str) -> Vec<CategoryPill> {
    pills_from_coverage(catalog, &analyze_coverage(catalog, text))
}

// ---------------------------------------------------------------------------
// Text similarity
// ---------------------------------------------------------------------------

fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    NON_WORD_RE
        .replace_all(&lowered, " ")
        .split_whitespace()
        .filter(|t| t.chars().count() >= HP.min_token_chars)
        .map(str::to_string)
        .collect()
}

fn are_synonyms(a: &str, b: &str) -> bool {
    SYNONYM_GROUPS
        .iter()
        .any(|group| group.contains(&a) && group.contains(&b))
}

fn pair_score(a: &str, b: &str) -> f64 {
    if a == b {
        HP.exact_match_score
    } else if are_synonyms(a, b) {
        HP.synonym_match_score
    } else if a.contains(b) || b.contains(a) {
        HP.partial_match_score
    } else {
        0.0
    }
}

pub fn similarity(user_text: &str, question: &str) -> f64 {
    let user_tokens = tokenize(user_text);
    let question_tokens = tokenize(question);
    if user_tokens.is_empty() || question_tokens.is_empty() {
        return 0.0;
    }

    let overlap: f64 = user_tokens
        .iter()
        .flat_map(|u| question_tokens.iter().map(move |q| pair_score(u, q)))
        .sum();
    let max_possible =
        HP.exact_match_score * user_tokens.len().max(question_tokens.len()) as f64;
    (overlap / max_possible).min(1.0)
}

// Ties go to the earliest index.
pub fn least_similar_question<S: AsRef<str>>(
    user_text: &str,
    questions: &[S],
    exclude: &BTreeSet<usize>,
) -> Option<SimilarityResult> {
    let mut best: Option<SimilarityResult> = None;
    for (index, question) in questions.iter().enumerate() {
        if exclude.contains(&index) {
            continue;
        }
        let question = question.as_ref();
        let score = similarity(user_text, question);
        trace!(question, score, "question similarity");
        if best.as_ref().map_or(true, |b| score < b.score) {
            best = Some(SimilarityResult {
                question: question.to_string(),
                index,
                score,
            });
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Random sources
// ---------------------------------------------------------------------------

pub trait RandomSource {
    /// An index in `0..len`. Callers never pass `len == 0`.
    fn pick(&mut self, len: usize) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn pick(&mut self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }
}

#[derive(Debug, Clone)]
pub struct SeededRandom(StdRng);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for SeededRandom {
    fn pick(&mut self, len: usize) -> usize {
        self.0.gen_range(0..len)
    }
}

impl<R: RandomSource + ?Sized> RandomSource for Box<R> {
    fn pick(&mut self, len: usize) -> usize {
        (**self).pick(len)
    }
}

// ---------------------------------------------------------------------------
// Question selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QuestionState(BTreeMap<String, BTreeSet<usize>>);

impl QuestionState {
    pub fn used(&self, category: &str) -> Option<&BTreeSet<usize>> {
        self.0.get(category)
    }

    pub fn used_count(&self, category: &str) -> usize {
        self.0.get(category).map_or(0, BTreeSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorOptions {
    pub reset_on_large_deletion: bool,
    pub deletion_ratio: f64,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            reset_on_large_deletion: true,
            deletion_ratio: HP.deletion_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectorSnapshot {
    pub covered_topics: Vec<CoveredTopic>,
    pub question_state: QuestionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewReport {
    pub last_sentence: String,
    pub completed_sentence: bool,
    pub detected_topics: Vec<String>,
    pub topic_scores: Vec<TopicScore>,
    pub coverage: Vec<CoveredTopic>,
    pub pills: Vec<CategoryPill>,
    pub questions: Vec<String>,
}

#[derive(Debug)]
pub struct QuestionSelector<R = ThreadRandom> {
    catalog: Arc<Catalog>,
    rng: R,
    options: SelectorOptions,
    question_state: QuestionState,
    last_analyzed_text: String,
    covered_topics: Vec<CoveredTopic>,
}

impl QuestionSelector<ThreadRandom> {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_random(catalog, ThreadRandom)
    }
}

impl<R: RandomSource> QuestionSelector<R> {
    pub fn with_random(catalog: Arc<Catalog>, rng: R) -> Self {
        Self {
            catalog,
            rng,
            options: SelectorOptions::default(),
            question_state: QuestionState::default(),
            last_analyzed_text: String::new(),
            covered_topics: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: SelectorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn covered_topics(&self) -> &[CoveredTopic] {
        &self.covered_topics
    }

    pub fn question_state(&self) -> &QuestionState {
        &self.question_state
    }

    pub fn snapshot(&self) -> SelectorSnapshot {
        SelectorSnapshot {
            covered_topics: self.covered_topics.clone(),
            question_state: self.question_state.clone(),
        }
    }

    pub fn reset(&mut self) {
        self.question_state.clear();
        self.last_analyzed_text.clear();
        self.covered_topics.clear();
    }

    /// Next follow-up question for the review as currently written. Never empty.
    pub fn get_smart_question(&mut self, review_text: &str) -> String {
        self.refresh_coverage(review_text);

        let catalog = Arc::clone(&self.catalog);
        let sentence = last_sentence(review_text);
        if sentence.is_empty() {
            return self.question_from_uncovered_category();
        }

        for category in detect_topics(&catalog, sentence) {
            if is_well_covered(category, &self.covered_topics) {
                debug!(category, "detected topic already well covered");
                continue;
            }
            if let Some(question) = self.question_from_category(category, sentence) {
                debug!(category, "asking about detected topic");
                return question;
            }
        }

        self.question_from_uncovered_category()
    }

    pub fn review(&mut self, review_text: &str, count: usize) -> ReviewReport {
        let questions: Vec<String> = (0..count).map(|_| self.get_smart_question(review_text)).collect();
        let coverage = analyze_coverage(&self.catalog, review_text);
        let sentence = last_sentence(review_text);

        ReviewReport {
            last_sentence: sentence.to_string(),
            completed_sentence: ends_with_completed_sentence(review_text),
            detected_topics: detect_topics(&self.catalog, sentence)
                .into_iter()
                .map(str::to_string)
                .collect(),
            topic_scores: score_topics(&self.catalog, sentence),
            pills: pills_from_coverage(&self.catalog, &coverage),
            coverage,
            questions,
        }
    }

    fn refresh_coverage(&mut self, review_text: &str) {
        if review_text == self.last_analyzed_text {
            return;
        }

        let previous_len = self.last_analyzed_text.chars().count();
        let current_len = review_text.chars().count();
        self.covered_topics = analyze_coverage(&self.catalog, review_text);
        self.last_analyzed_text = review_text.to_string();

        if self.options.reset_on_large_deletion
            && previous_len > 0
            && (current_len as f64) < previous_len as f64 * self.options.deletion_ratio
        {
            debug!(previous_len, current_len, "large deletion, forgetting shown questions");
            self.question_state.clear();
        }
    }

    fn question_from_category(&mut self, category: &str, context: &str) -> Option<String> {
        let catalog = Arc::clone(&self.catalog);
        let bank = catalog.questions_for(category);
        if bank.is_empty() {
            return None;
        }

        let used = self.question_state.0.entry(category.to_string()).or_default();
        if used.len() >= bank.len() {
            trace!(category, "question bank exhausted, starting over");
            used.clear();
        }

        let selected = least_similar_question(context, bank, used)?;
        used.insert(selected.index);
        debug!(
            category,
            index = selected.index,
            similarity = selected.score,
            "selected question"
        );
        Some(selected.question)
    }

    fn question_from_uncovered_category(&mut self) -> String {
        let catalog = Arc::clone(&self.catalog);
        let all = catalog.list_categories();

        let uncovered = uncovered_categories(&all, &self.covered_topics);
        if !uncovered.is_empty() {
            let category = uncovered[self.rng.pick(uncovered.len()) % uncovered.len()];
            debug!(category, "asking about uncovered category");
            if let Some(question) = self.question_from_category(category, "") {
                return question;
            }
        }

        let lightly = lightly_covered_categories(&all, &self.covered_topics);
        if !lightly.is_empty() {
            let category = lightly[self.rng.pick(lightly.len()) % lightly.len()];
            debug!(category, "asking about lightly covered category");
            if let Some(question) = self.question_from_category(category, "") {
                return question;
            }
        }

        for category in all.iter().copied() {
            if self.question_state.used_count(category) < catalog.questions_for(category).len() {
                debug!(category, "asking about category with unused questions");
                if let Some(question) = self.question_from_category(category, "") {
                    return question;
                }
            }
        }

        debug!("all questions shown, resetting");
        self.reset();
        if let Some(first) = all.first() {
            if let Some(question) = self.question_from_category(first, "") {
                return question;
            }
        }

        FALLBACK_QUESTION.to_string()
    }
}
