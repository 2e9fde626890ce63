//! CSV loading and the compact dataset summary used as LLM context.

use std::fmt;
use std::path::Path;

use crate::errors::AppError;

/// Column type inferred from the cell values, mirroring the dtype names the
/// executed pandas code will actually see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Float64,
    Bool,
    Object,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::Bool => "bool",
            ColumnType::Object => "object",
        };
        f.write_str(name)
    }
}

/// In-memory snapshot of the tabular dataset: named columns, string cells.
///
/// The snapshot only feeds the prompt context and the preview page; the
/// execution subprocess loads the CSV itself with pandas.
#[derive(Debug, Clone)]
pub struct Dataset {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Dataset {
    /// Load the CSV at `path`. No schema validation: whatever columns and
    /// types the file contains are accepted.
    pub fn from_csv(path: &Path) -> Result<Self, AppError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| AppError::Dataset(format!("{}: {e}", path.display())))?;

        let headers = reader
            .headers()
            .map_err(|e| AppError::Dataset(e.to_string()))?
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| AppError::Dataset(e.to_string()))?;
            let mut row: Vec<String> = record.iter().map(|c| c.to_string()).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    /// First `n` rows, for the preview page.
    pub fn head(&self, n: usize) -> &[Vec<String>] {
        &self.rows[..self.rows.len().min(n)]
    }

    pub fn column_type(&self, index: usize) -> ColumnType {
        infer_column_type(self.rows.iter().map(|r| r[index].as_str()))
    }

    /// Compact, LLM-friendly description: column list, dtypes, example rows.
    pub fn describe(&self, max_rows: usize) -> String {
        let columns = self
            .headers
            .iter()
            .map(|h| format!("'{h}'"))
            .collect::<Vec<_>>()
            .join(", ");

        let name_width = self.headers.iter().map(|h| h.len()).max().unwrap_or(0);
        let dtypes = self
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| format!("{h:<name_width$}    {}", self.column_type(i)))
            .collect::<Vec<_>>()
            .join("\n");

        let mut table = vec![self.headers.clone()];
        table.extend(self.head(max_rows).iter().cloned());
        let example_rows = render_table(&table);

        format!("Columns: [{columns}]\n\nData types:\n{dtypes}\n\nExample rows:\n{example_rows}")
    }
}

/// Column-aligned plain-text table (first row is the header).
fn render_table(rows: &[Vec<String>]) -> String {
    let cols = rows.first().map(|r| r.len()).unwrap_or(0);
    let mut widths = vec![0usize; cols];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    rows.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, cell)| format!("{cell:>width$}", width = widths[i]))
                .collect::<Vec<_>>()
                .join("  ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn infer_column_type<'a>(values: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut saw_value = false;
    let mut all_int = true;
    let mut all_float = true;
    let mut all_bool = true;

    for v in values {
        let v = v.trim();
        if v.is_empty() {
            // Missing values don't demote int to object, matching pandas
            // loosely enough for a summary.
            continue;
        }
        saw_value = true;
        if v.parse::<i64>().is_err() {
            all_int = false;
        }
        if v.parse::<f64>().is_err() {
            all_float = false;
        }
        if !matches!(v, "true" | "false" | "True" | "False") {
            all_bool = false;
        }
        if !all_int && !all_float && !all_bool {
            return ColumnType::Object;
        }
    }

    if !saw_value {
        ColumnType::Object
    } else if all_bool {
        ColumnType::Bool
    } else if all_int {
        ColumnType::Int64
    } else if all_float {
        ColumnType::Float64
    } else {
        ColumnType::Object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_csv() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("temp csv");
        writeln!(f, "make,price,mileage,used").unwrap();
        writeln!(f, "audi,20000,45000.5,true").unwrap();
        writeln!(f, "bmw,35000,12000.0,false").unwrap();
        writeln!(f, "vw,9000,150000.25,true").unwrap();
        f
    }

    #[test]
    fn loads_headers_and_rows() {
        let f = sample_csv();
        let ds = Dataset::from_csv(f.path()).unwrap();
        assert_eq!(ds.headers(), &["make", "price", "mileage", "used"]);
        assert_eq!(ds.row_count(), 3);
        assert_eq!(ds.column_count(), 4);
        assert_eq!(ds.head(2).len(), 2);
    }

    #[test]
    fn infers_column_types() {
        let f = sample_csv();
        let ds = Dataset::from_csv(f.path()).unwrap();
        assert_eq!(ds.column_type(0), ColumnType::Object);
        assert_eq!(ds.column_type(1), ColumnType::Int64);
        assert_eq!(ds.column_type(2), ColumnType::Float64);
        assert_eq!(ds.column_type(3), ColumnType::Bool);
    }

    #[test]
    fn describe_lists_columns_dtypes_and_example_rows() {
        let f = sample_csv();
        let ds = Dataset::from_csv(f.path()).unwrap();
        let desc = ds.describe(2);

        assert!(desc.starts_with("Columns: ['make', 'price', 'mileage', 'used']"));
        assert!(desc.contains("Data types:"));
        assert!(desc.contains("int64"));
        assert!(desc.contains("object"));
        assert!(desc.contains("Example rows:"));
        assert!(desc.contains("audi"));
        assert!(desc.contains("bmw"));
        // head(2) must not include the third row
        assert!(!desc.contains("vw"));
    }

    #[test]
    fn missing_file_is_a_dataset_error() {
        let err = Dataset::from_csv(Path::new("/nonexistent/cars.csv")).unwrap_err();
        assert!(matches!(err, AppError::Dataset(_)));
    }

    #[test]
    fn short_records_are_padded() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "a,b,c").unwrap();
        writeln!(f, "1,2").unwrap();
        let ds = Dataset::from_csv(f.path()).unwrap();
        assert_eq!(ds.head(1)[0], vec!["1", "2", ""]);
    }
}
