use std::collections::BTreeSet;
use std::io::Write;

use review_coach::{
    analyze_coverage, category_label, coverage_pills, detect_topics, ends_with_completed_sentence,
    is_well_covered, last_sentence, least_similar_question, lightly_covered_categories,
    score_topics, similarity, uncovered_categories, Catalog, CoachError, CoveredTopic, TopicScore,
};

const RUDE_STAFF: &str = "The staff at the front desk were incredibly rude and unhelpful.";
const CLEAN_REVIEW: &str = "The room was spotless. Bathroom was very clean too. \
                            Housekeeping did a great job keeping it tidy.";

fn covered(category: &str, score: u32) -> CoveredTopic {
    CoveredTopic {
        category: category.to_string(),
        score,
        examples: vec![],
    }
}

fn score_of(scores: &[TopicScore], category: &str) -> Option<u32> {
    scores.iter().find(|s| s.category == category).map(|s| s.score)
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[test]
fn builtin_catalog_lists_categories_in_order() {
    let catalog = Catalog::builtin();
    assert_eq!(
        catalog.list_categories(),
        vec![
            "LOCATION",
            "ATMOSPHERE",
            "CLEANLINESS",
            "ROOMS",
            "NOISE",
            "SERVICE",
            "AMENITIES",
            "VALUE"
        ]
    );
    for name in catalog.list_categories() {
        assert!(!catalog.questions_for(name).is_empty(), "{name} has no questions");
    }
}

#[test]
fn unknown_category_has_no_questions() {
    let catalog = Catalog::builtin();
    assert!(catalog.questions_for("SPACESHIPS").is_empty());
    assert!(catalog.get("SPACESHIPS").is_none());
}

#[test]
fn empty_catalog_is_rejected() {
    assert!(matches!(Catalog::new(vec![]), Err(CoachError::EmptyCatalog)));
}

#[test]
fn invalid_catalogs_are_rejected() {
    let duplicate = r#"
        [[categories]]
        name = "FOOD"
        questions = ["How was dinner?"]

        [[categories]]
        name = "FOOD"
        questions = ["How was lunch?"]
    "#;
    assert!(matches!(
        Catalog::from_toml_str(duplicate),
        Err(CoachError::DuplicateCategory { name }) if name == "FOOD"
    ));

    let no_questions = r#"
        [[categories]]
        name = "FOOD"
        questions = []
    "#;
    assert!(matches!(
        Catalog::from_toml_str(no_questions),
        Err(CoachError::EmptyQuestionBank { category }) if category == "FOOD"
    ));

    let zero_weight = r#"
        [[categories]]
        name = "FOOD"
        questions = ["How was dinner?"]

        [[categories.patterns]]
        triggers = ["dinner"]
        weight = 0
    "#;
    assert!(matches!(
        Catalog::from_toml_str(zero_weight),
        Err(CoachError::InvalidWeight { rule: 0, .. })
    ));

    assert!(matches!(
        Catalog::from_toml_str("categories = 3"),
        Err(CoachError::CatalogParse(_))
    ));
}

#[test]
fn catalog_loads_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [[categories]]
        name = "FOOD"
        keywords = ["dinner", "menu"]
        questions = ["What did you eat?", "How was the menu?"]

        [[categories.patterns]]
        triggers = ["Dinner", "MENU"]
        context = ["tasty"]
        sentiment = "positive"
        weight = 3
        "#
    )
    .unwrap();

    let catalog = Catalog::load(file.path()).unwrap();
    assert_eq!(catalog.list_categories(), vec!["FOOD"]);
    assert_eq!(catalog.questions_for("FOOD").len(), 2);
    assert_eq!(catalog.categories()[0].patterns[0].triggers, vec!["dinner", "menu"]);
    assert_eq!(detect_topics(&catalog, "Dinner was fine"), vec!["FOOD"]);
}

#[test]
fn missing_catalog_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Catalog::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, CoachError::CatalogRead { .. }));
}

// ---------------------------------------------------------------------------
// Sentence extraction
// ---------------------------------------------------------------------------

#[test]
fn last_sentence_skips_trailing_terminator() {
    assert_eq!(
        last_sentence("The room was great. The staff were rude!"),
        "The staff were rude"
    );
    assert_eq!(last_sentence("Single sentence."), "Single sentence");
    assert_eq!(last_sentence("  Was it worth it?  "), "Was it worth it");
}

#[test]
fn last_sentence_without_terminator_keeps_text() {
    assert_eq!(last_sentence("Loved it"), "Loved it");
    assert_eq!(last_sentence("First one. Still typing"), "Still typing");
    assert_eq!(last_sentence("Nice room. Great sta"), "Great sta");
}

#[test]
fn last_sentence_of_blank_text_is_empty() {
    assert_eq!(last_sentence(""), "");
    assert_eq!(last_sentence("   \n"), "");
    assert_eq!(last_sentence("."), "");
}

#[test]
fn completed_sentence_needs_terminator_and_two_words() {
    assert!(ends_with_completed_sentence("Great stay."));
    assert!(ends_with_completed_sentence("Fine. The pool was cold!"));
    assert!(!ends_with_completed_sentence("Wow."));
    assert!(!ends_with_completed_sentence("Great stay"));
    assert!(!ends_with_completed_sentence(""));
}

// ---------------------------------------------------------------------------
// Topic detection
// ---------------------------------------------------------------------------

#[test]
fn blank_text_detects_nothing() {
    let catalog = Catalog::builtin();
    assert!(detect_topics(&catalog, "").is_empty());
    assert!(detect_topics(&catalog, "   ").is_empty());
    assert!(score_topics(&catalog, "").is_empty());
}

#[test]
fn detects_service_from_rude_staff() {
    let catalog = Catalog::builtin();
    let topics = detect_topics(&catalog, RUDE_STAFF);
    assert_eq!(topics, vec!["SERVICE"]);

    // staff 4, rude with staff context 3 + 2, front desk 2
    let scores = score_topics(&catalog, RUDE_STAFF);
    let service = scores.iter().find(|s| s.category == "SERVICE").unwrap();
    assert_eq!(service.score, 11);
}

#[test]
fn detection_is_case_insensitive() {
    let catalog = Catalog::builtin();
    assert_eq!(detect_topics(&catalog, "THE POOL"), vec!["AMENITIES"]);
}

#[test]
fn weak_single_rule_stays_below_threshold() {
    let catalog = Catalog::builtin();
    // "nearby" alone is worth 2
    assert!(detect_topics(&catalog, "nearby").is_empty());
    let scores = score_topics(&catalog, "nearby");
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].category, "LOCATION");
    assert_eq!(scores[0].score, 2);
}

#[test]
fn sentiment_adds_bonus() {
    let catalog = Catalog::builtin();
    let plain = score_topics(&catalog, "it was quiet");
    let happy = score_topics(&catalog, "it was quiet and nice");
    assert_eq!(score_of(&plain, "NOISE"), Some(3));
    assert_eq!(score_of(&happy, "NOISE"), Some(4));
}

#[test]
fn detects_multiple_topics_in_catalog_order() {
    let catalog = Catalog::builtin();
    let topics = detect_topics(&catalog, "The room was spotless but the price was high");
    assert_eq!(topics, vec!["CLEANLINESS", "ROOMS", "VALUE"]);
}

#[test]
fn detected_topics_are_catalog_names() {
    let catalog = Catalog::builtin();
    let names = catalog.list_categories();
    for text in [
        RUDE_STAFF,
        CLEAN_REVIEW,
        "The train station was close and the walk was easy.",
        "Loud music from the bar kept us awake all night.",
        "asdf qwerty",
    ] {
        for topic in detect_topics(&catalog, text) {
            assert!(names.contains(&topic), "{topic} is not in the catalog");
        }
    }
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

#[test]
fn cleanliness_review_is_well_covered() {
    let catalog = Catalog::builtin();
    let topics = analyze_coverage(&catalog, CLEAN_REVIEW);

    let cleanliness = topics.iter().find(|t| t.category == "CLEANLINESS").unwrap();
    assert_eq!(cleanliness.score, 3);
    assert_eq!(cleanliness.examples.len(), 3);
    assert_eq!(cleanliness.examples[0], "The room was spotless");
    assert!(is_well_covered("CLEANLINESS", &topics));
    assert!(!is_well_covered("SERVICE", &topics));
}

#[test]
fn coverage_is_idempotent() {
    let catalog = Catalog::builtin();
    let text = format!("{RUDE_STAFF} {CLEAN_REVIEW} The pool was lovely!");
    assert_eq!(analyze_coverage(&catalog, &text), analyze_coverage(&catalog, &text));
}

#[test]
fn coverage_ignores_short_fragments() {
    let catalog = Catalog::builtin();
    // "Pool!" is detected on its own but is too short to count
    assert_eq!(detect_topics(&catalog, "Pool"), vec!["AMENITIES"]);
    assert!(analyze_coverage(&catalog, "Pool! Spa!").is_empty());
    assert!(analyze_coverage(&catalog, "   ").is_empty());
}

#[test]
fn unmentioned_categories_are_absent() {
    let catalog = Catalog::builtin();
    let topics = analyze_coverage(&catalog, RUDE_STAFF);
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].category, "SERVICE");
    assert_eq!(topics[0].score, 1);
}

#[test]
fn well_covered_needs_two_mentions() {
    let topics = vec![covered("SERVICE", 1), covered("VALUE", 2)];
    assert!(!is_well_covered("SERVICE", &topics));
    assert!(is_well_covered("VALUE", &topics));
    assert!(!is_well_covered("NOISE", &topics));
}

#[test]
fn uncovered_and_lightly_covered_split_the_catalog() {
    let all = ["LOCATION", "SERVICE", "VALUE", "NOISE"];
    let topics = vec![covered("SERVICE", 1), covered("VALUE", 3)];
    assert_eq!(uncovered_categories(&all, &topics), vec!["LOCATION", "NOISE"]);
    assert_eq!(lightly_covered_categories(&all, &topics), vec!["SERVICE"]);
}

#[test]
fn pills_follow_coverage() {
    let catalog = Catalog::builtin();
    let pills = coverage_pills(&catalog, RUDE_STAFF);
    assert_eq!(pills.len(), catalog.categories().len());

    let service = pills.iter().find(|p| p.category == "SERVICE").unwrap();
    assert!(service.covered);
    assert_eq!(service.label, "Service");

    let noise = pills.iter().find(|p| p.category == "NOISE").unwrap();
    assert!(!noise.covered);
    assert_eq!(noise.label, "Noise level");
}

#[test]
fn category_labels() {
    assert_eq!(category_label("CLEANLINESS"), "Cleanliness");
    assert_eq!(category_label("NOISE"), "Noise level");
    assert_eq!(category_label(""), "");
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

#[test]
fn identical_single_token_scores_one() {
    assert_eq!(similarity("clean", "clean"), 1.0);
}

#[test]
fn identical_text_beats_unrelated_text() {
    let text = "The breakfast buffet had fresh pastries";
    let same = similarity(text, text);
    let unrelated = similarity(text, "Was parking expensive downtown?");
    assert!(same > unrelated, "{same} <= {unrelated}");
    assert!(same <= 1.0);
}

#[test]
fn synonyms_and_substrings_score_partially() {
    assert!((similarity("spotless", "tidy") - 2.0 / 3.0).abs() < 1e-9);
    assert!((similarity("room", "rooms") - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(similarity("pool", "wifi"), 0.0);
}

#[test]
fn short_or_empty_tokens_score_zero() {
    assert_eq!(similarity("", "How was the pool?"), 0.0);
    assert_eq!(similarity("it is ok", "How was the pool?"), 0.0);
    assert_eq!(similarity("pool", "?!"), 0.0);
}

#[test]
fn least_similar_prefers_unrelated_question() {
    let questions = [
        "How clean was the bathroom?",
        "Did the parking cost extra?",
    ];
    let picked =
        least_similar_question("The bathroom was clean", &questions, &BTreeSet::new()).unwrap();
    assert_eq!(picked.index, 1);
    assert_eq!(picked.question, "Did the parking cost extra?");
}

#[test]
fn least_similar_breaks_ties_by_order() {
    let questions = ["First question?", "Second question?", "Third question?"];
    let picked = least_similar_question("", &questions, &BTreeSet::new()).unwrap();
    assert_eq!(picked.index, 0);
    assert_eq!(picked.score, 0.0);

    let exclude: BTreeSet<usize> = [0].into_iter().collect();
    let picked = least_similar_question("", &questions, &exclude).unwrap();
    assert_eq!(picked.index, 1);
}

#[test]
fn least_similar_never_returns_excluded_index() {
    let catalog = Catalog::builtin();
    let bank = catalog.questions_for("LOCATION");
    let mut exclude = BTreeSet::new();
    for _ in 0..bank.len() {
        let picked = least_similar_question("The area was great", bank, &exclude).unwrap();
        assert!(!exclude.contains(&picked.index));
        exclude.insert(picked.index);
    }
    assert!(least_similar_question("The area was great", bank, &exclude).is_none());
    assert!(least_similar_question::<&str>("anything", &[], &BTreeSet::new()).is_none());
}
