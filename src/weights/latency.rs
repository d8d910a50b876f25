use std::{fmt, str::FromStr};

use thiserror::Error;

/// Sentinel for a latency that was never measured (unreachable replica).
pub const MISSING: i64 = 1_000_000_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LatencyError {
    #[error("latency matrix must be square: row {row} has {len} entries, expected {expected}")]
    NotSquare { row: usize, len: usize, expected: usize },

    #[error("negative latency {value} at ({row}, {col})")]
    Negative { row: usize, col: usize, value: i64 },

    #[error("unparsable latency {token:?} in row {row}")]
    Parse { row: usize, token: String },
}

/// N x N one-way latencies in microseconds; `m[i][j]` is the delay of a
/// message from replica `i` to replica `j`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LatencyMatrix {
    n: usize,
    cells: Vec<i64>,
}

impl LatencyMatrix {
    /// Nothing measured yet: zero on the diagonal, `MISSING` elsewhere.
    pub fn new(n: usize) -> Self {
        let mut cells = vec![MISSING; n * n];
        for i in 0..n {
            cells[i * n + i] = 0;
        }
        LatencyMatrix { n, cells }
    }

    pub fn from_rows(rows: Vec<Vec<i64>>) -> Result<Self, LatencyError> {
        let n = rows.len();
        let mut cells = Vec::with_capacity(n * n);
        for (row, values) in rows.into_iter().enumerate() {
            if values.len() != n {
                return Err(LatencyError::NotSquare {
                    row,
                    len: values.len(),
                    expected: n,
                });
            }
            for (col, value) in values.into_iter().enumerate() {
                if value < 0 {
                    return Err(LatencyError::Negative { row, col, value });
                }
                cells.push(value);
            }
        }
        Ok(LatencyMatrix { n, cells })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn get(&self, from: usize, to: usize) -> i64 {
        self.cells[from * self.n + to]
    }

    pub fn set(&mut self, from: usize, to: usize, latency: i64) {
        self.cells[from * self.n + to] = latency.max(0);
    }

    pub fn row(&self, from: usize) -> &[i64] {
        &self.cells[from * self.n..(from + 1) * self.n]
    }

    /// Replaces row `from` with `values`, padding missing entries with `MISSING`.
    pub fn set_row(&mut self, from: usize, values: &[i64]) {
        for to in 0..self.n {
            let value = values.get(to).copied().unwrap_or(MISSING);
            self.set(from, to, value);
        }
    }

    /// Assumes symmetric links and keeps the slower observed direction:
    /// `m*[i][j] = max(m[i][j], m[j][i])`, with a zero diagonal.
    pub fn sanitize(&self) -> LatencyMatrix {
        let n = self.n;
        let mut cells = vec![0; n * n];
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    cells[i * n + j] = self.get(i, j).max(self.get(j, i));
                }
            }
        }
        LatencyMatrix { n, cells }
    }
}

impl fmt::Display for LatencyMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.n {
            let row: Vec<String> = self
                .row(i)
                .iter()
                .map(|&v| if v >= MISSING { "-".to_string() } else { v.to_string() })
                .collect();
            writeln!(f, "{}", row.join("\t"))?;
        }
        Ok(())
    }
}

/// One row per line, entries separated by whitespace or commas. Blank lines
/// and lines starting with `#` are skipped; `-` stands for `MISSING`.
impl FromStr for LatencyMatrix {
    type Err = LatencyError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut rows = Vec::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = rows.len();
            let values = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|token| !token.is_empty())
                .map(|token| match token {
                    "-" => Ok(MISSING),
                    _ => token.parse::<i64>().map_err(|_| LatencyError::Parse {
                        row,
                        token: token.to_string(),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(values);
        }
        LatencyMatrix::from_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_is_unmeasured() {
        let m = LatencyMatrix::new(3);
        assert_eq!(m.get(1, 1), 0);
        assert_eq!(m.get(0, 2), MISSING);
    }

    #[test]
    fn test_from_rows_validates() {
        assert_eq!(
            LatencyMatrix::from_rows(vec![vec![0, 1], vec![0]]),
            Err(LatencyError::NotSquare { row: 1, len: 1, expected: 2 })
        );
        assert_eq!(
            LatencyMatrix::from_rows(vec![vec![0, -1], vec![0, 0]]),
            Err(LatencyError::Negative { row: 0, col: 1, value: -1 })
        );
    }

    #[test]
    fn test_sanitize_takes_slower_direction() {
        let m = LatencyMatrix::from_rows(vec![vec![5, 10, 30], vec![20, 0, MISSING], vec![30, 7, 0]])
            .unwrap();
        let s = m.sanitize();
        assert_eq!(s.get(0, 0), 0);
        assert_eq!(s.get(0, 1), 20);
        assert_eq!(s.get(1, 0), 20);
        assert_eq!(s.get(1, 2), MISSING);
        assert_eq!(s.get(2, 1), MISSING);
    }

    #[test]
    fn test_set_row_pads_missing() {
        let mut m = LatencyMatrix::new(3);
        m.set_row(1, &[4, 0]);
        assert_eq!(m.row(1), &[4, 0, MISSING]);
    }

    fn matrix() -> impl Strategy<Value = LatencyMatrix> {
        (1usize..7).prop_flat_map(|n| {
            prop::collection::vec(prop::collection::vec(0i64..1_000_000, n), n)
                .prop_map(|rows| LatencyMatrix::from_rows(rows).unwrap())
        })
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(m in matrix()) {
            let once = m.sanitize();
            prop_assert_eq!(once.sanitize(), once.clone());
            for i in 0..once.len() {
                prop_assert_eq!(once.get(i, i), 0);
                for j in 0..once.len() {
                    prop_assert_eq!(once.get(i, j), once.get(j, i));
                }
            }
        }
    }

    #[test]
    fn test_parse_text() {
        let text = "# wan\n0, 20, -\n20 0 100\n\n30 100 0\n";
        let m: LatencyMatrix = text.parse().unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m.get(0, 2), MISSING);
        assert_eq!(m.get(2, 0), 30);

        assert_eq!(
            "0 x\n1 0".parse::<LatencyMatrix>(),
            Err(LatencyError::Parse {
                row: 0,
                token: "x".to_string()
            })
        );
        assert!(matches!(
            "0 1\n1".parse::<LatencyMatrix>(),
            Err(LatencyError::NotSquare { row: 1, .. })
        ));
    }
}
