use crate::value::Row;
use serde::Serialize;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    Odd,
    Even,
}

impl Parity {
    pub fn of(ordinal: usize) -> Self {
        if ordinal % 2 == 1 {
            Parity::Odd
        } else {
            Parity::Even
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Parity::Odd => "odd",
            Parity::Even => "even",
        }
    }
}

/// A row that survived population, numbered from 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewRow {
    pub key: String,
    pub ordinal: usize,
    pub parity: Parity,
    pub row: Row,
}

/// Position over an immutable row snapshot. Starts unset.
#[derive(Debug, Clone)]
pub struct Cursor {
    rows: Rc<[ViewRow]>,
    position: Option<usize>,
}

impl Cursor {
    pub fn new(rows: Rc<[ViewRow]>) -> Self {
        Cursor {
            rows,
            position: None,
        }
    }

    pub fn empty() -> Self {
        Cursor::new(Rc::from(Vec::new()))
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn current(&self) -> Option<&ViewRow> {
        self.position.and_then(|i| self.rows.get(i))
    }

    pub fn unset(&mut self) {
        self.position = None;
    }

    /// Move to the first row.
    pub fn reset(&mut self) -> Option<&ViewRow> {
        self.position = (!self.rows.is_empty()).then_some(0);
        self.current()
    }

    /// Move to the last row.
    pub fn end(&mut self) -> Option<&ViewRow> {
        self.position = self.rows.len().checked_sub(1);
        self.current()
    }

    /// Advance one row. From unset, `rewind` starts at the first row.
    /// Stepping past the last row unsets the cursor.
    pub fn next(&mut self, rewind: bool) -> Option<&ViewRow> {
        match self.position {
            None if rewind => self.reset(),
            None => None,
            Some(i) if i + 1 < self.rows.len() => {
                self.position = Some(i + 1);
                self.current()
            }
            Some(_) => {
                self.position = None;
                None
            }
        }
    }

    /// Step back one row. From unset, `rewind` starts at the last row.
    /// Stepping before the first row unsets the cursor.
    pub fn previous(&mut self, rewind: bool) -> Option<&ViewRow> {
        match self.position {
            None if rewind => self.end(),
            None => None,
            Some(0) => {
                self.position = None;
                None
            }
            Some(i) => {
                self.position = Some(i - 1);
                self.current()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn snapshot(count: usize) -> Rc<[ViewRow]> {
        (1..=count)
            .map(|n| ViewRow {
                key: n.to_string(),
                ordinal: n,
                parity: Parity::of(n),
                row: [("id", Value::Int(n as i64))].into_iter().collect(),
            })
            .collect()
    }

    #[test]
    fn test_forward_walk_visits_each_row_once() {
        let mut cursor = Cursor::new(snapshot(3));
        assert!(cursor.current().is_none());

        let mut seen = vec![cursor.next(true).unwrap().ordinal];
        while let Some(row) = cursor.next(false) {
            seen.push(row.ordinal);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(cursor.position(), None);
        assert!(cursor.next(false).is_none());
    }

    #[test]
    fn test_backward_walk() {
        let mut cursor = Cursor::new(snapshot(3));
        assert!(cursor.previous(false).is_none());
        assert_eq!(cursor.previous(true).unwrap().ordinal, 3);
        assert_eq!(cursor.previous(false).unwrap().ordinal, 2);
        assert_eq!(cursor.previous(false).unwrap().ordinal, 1);
        assert!(cursor.previous(false).is_none());
        assert_eq!(cursor.position(), None);
    }

    #[test]
    fn test_reset_end_and_unset() {
        let mut cursor = Cursor::new(snapshot(2));
        assert_eq!(cursor.end().unwrap().key, "2");
        assert_eq!(cursor.reset().unwrap().key, "1");
        cursor.unset();
        assert!(cursor.current().is_none());
    }

    #[test]
    fn test_empty_snapshot() {
        let mut cursor = Cursor::empty();
        assert!(cursor.is_empty());
        assert!(cursor.next(true).is_none());
        assert!(cursor.previous(true).is_none());
        assert!(cursor.reset().is_none());
        assert!(cursor.end().is_none());
    }

    #[test]
    fn test_parity() {
        assert_eq!(Parity::of(1), Parity::Odd);
        assert_eq!(Parity::of(2).as_str(), "even");
    }
}
