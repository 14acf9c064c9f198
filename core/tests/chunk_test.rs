use verse_core::chunk::split_text;

fn squash(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

// No character may be lost by splitting, whatever the input shape.
fn assert_lossless(original: &str, chunks: &[String]) {
    assert_eq!(squash(&chunks.join(" ")), squash(original));
}

#[test]
fn short_text_is_one_chunk() {
    let chunks = split_text("Hello there.", 400);
    assert_eq!(chunks, vec!["Hello there.".to_string()]);
}

#[test]
fn blank_text_yields_no_chunks() {
    assert!(split_text("   \n\t ", 100).is_empty());
}

#[test]
fn splits_at_sentence_boundaries() {
    let s1 = format!("{} one.", "alpha beta gamma delta".repeat(13));
    let s2 = format!("{} two!", "epsilon zeta eta theta".repeat(13));
    let s3 = format!("{} three?", "iota kappa lambda mu".repeat(13));
    let text = format!("{s1} {s2} {s3}");
    assert!(text.chars().count() > 800);

    let chunks = split_text(&text, 400);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0], s1);
    assert_eq!(chunks[1], s2);
    assert_eq!(chunks[2], s3);
    for c in &chunks {
        assert!(c.chars().count() <= 400);
    }
    assert_lossless(&text, &chunks);
}

#[test]
fn packs_multiple_sentences_per_chunk() {
    let text = "One two. Three four. Five six. Seven eight.";
    let chunks = split_text(text, 25);
    assert!(chunks.len() >= 2);
    for c in &chunks {
        assert!(c.chars().count() <= 25, "chunk too long: {c:?}");
        assert!(c.ends_with('.'), "sentence punctuation must stay attached: {c:?}");
    }
    assert_lossless(text, &chunks);
}

#[test]
fn oversized_sentence_falls_back_to_words() {
    let text = "this single sentence just keeps going and going without any terminal punctuation until well past the limit";
    let chunks = split_text(text, 30);
    assert!(chunks.len() > 1);
    for c in &chunks {
        assert!(c.chars().count() <= 30);
    }
    assert_lossless(text, &chunks);
}

#[test]
fn giant_token_is_emitted_verbatim() {
    let word = "x".repeat(50);
    let text = format!("tiny {word} tail");
    let chunks = split_text(&text, 10);
    assert!(chunks.contains(&word), "oversized token must not be discarded");
    assert_lossless(&text, &chunks);
}

#[test]
fn punctuation_runs_stay_whole() {
    let text = "Really?! Yes. Definitely maybe.";
    let chunks = split_text(text, 12);
    assert!(chunks[0].starts_with("Really?!"));
    assert_lossless(text, &chunks);
}

#[test]
fn exact_boundary_is_not_split() {
    let text = "a".repeat(100);
    let chunks = split_text(&text, 100);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0], text);
}
