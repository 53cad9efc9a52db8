// Plagiarism signal over the free-text answers of one submission batch.
// Advisory only: the score never feeds back into total_score.

use std::collections::HashMap;

/// Lowercase words with surrounding punctuation stripped
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
}

type TermVector = HashMap<String, f64>;

fn term_frequencies(text: &str) -> TermVector {
    let mut tf = TermVector::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0.0) += 1.0;
    }
    tf
}

/// Cosine similarity of two sparse term vectors; 0 when either is empty
fn cosine_similarity(a: &TermVector, b: &TermVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(term, x)| large.get(term).map(|y| x * y))
        .sum();
    let norm_a = a.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.values().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimilarityAnalyzer;

impl SimilarityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Pairwise similarity; the diagonal is zeroed
    pub fn similarity_matrix(&self, texts: &[&str]) -> Vec<Vec<f64>> {
        let vectors: Vec<TermVector> = texts.iter().map(|t| term_frequencies(t)).collect();
        let n = vectors.len();
        let mut matrix = vec![vec![0.0; n]; n];

        for i in 0..n {
            for j in (i + 1)..n {
                let sim = cosine_similarity(&vectors[i], &vectors[j]).clamp(0.0, 1.0);
                matrix[i][j] = sim;
                matrix[j][i] = sim;
            }
        }
        matrix
    }

    /// Maximum pairwise similarity in [0, 1]. Fewer than two texts scores 0.
    pub fn analyze(&self, texts: &[&str]) -> f64 {
        if texts.len() < 2 {
            return 0.0;
        }

        self.similarity_matrix(texts)
            .iter()
            .flat_map(|row| row.iter().copied())
            .fold(0.0_f64, f64::max)
            .clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lorem(words: usize) -> String {
        (0..words)
            .map(|i| format!("word{}", i % 37))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_fewer_than_two_texts_is_zero() {
        let analyzer = SimilarityAnalyzer::new();
        assert_eq!(analyzer.analyze(&[]), 0.0);
        assert_eq!(analyzer.analyze(&["a lonely answer"]), 0.0);
    }

    #[test]
    fn test_identical_texts_reach_maximum() {
        let analyzer = SimilarityAnalyzer::new();
        let text = lorem(200);
        let score = analyzer.analyze(&[&text, &text]);
        assert!((score - 1.0).abs() < 1e-9, "got {}", score);
    }

    #[test]
    fn test_disjoint_texts_are_zero() {
        let analyzer = SimilarityAnalyzer::new();
        let score = analyzer.analyze(&["alpha beta gamma", "delta epsilon zeta"]);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_diagonal_excluded() {
        let analyzer = SimilarityAnalyzer::new();
        let matrix = analyzer.similarity_matrix(&["same words", "other text", "more stuff"]);
        for (i, row) in matrix.iter().enumerate() {
            assert_eq!(row[i], 0.0);
        }
        // Self-similarity would be 1.0; only distinct pairs count
        assert_eq!(analyzer.analyze(&["same words", "other text"]), 0.0);
    }

    #[test]
    fn test_reports_most_similar_pair() {
        let analyzer = SimilarityAnalyzer::new();
        let score = analyzer.analyze(&[
            "indexes speed up reads",
            "unrelated sentence entirely",
            "Indexes speed up READS!",
        ]);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_overlap_between_bounds() {
        let analyzer = SimilarityAnalyzer::new();
        let score = analyzer.analyze(&["a b c d", "a b x y"]);
        assert!(score > 0.0 && score < 1.0);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_matrix_is_symmetric() {
        let analyzer = SimilarityAnalyzer::new();
        let matrix = analyzer.similarity_matrix(&["a b", "b c", "c d a"]);
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(matrix[i][j], matrix[j][i]);
            }
        }
    }

    #[test]
    fn test_tokenize() {
        let tokens: Vec<String> = tokenize("Hello, WORLD! --").collect();
        assert_eq!(tokens, vec!["hello", "world"]);
    }
}
