/// Cosine similarity `dot(a,b) / (|a|·|b|)`, accumulated in f64.
///
/// `None` when the vectors are empty or of different length; zero-norm vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return Some(0.0);
    }
    Some(dot / denom)
}

/// Strict `>` so that a score sitting exactly on the threshold is dropped.
pub fn above_threshold(score: f64, threshold: f64) -> bool {
    score > threshold
}
