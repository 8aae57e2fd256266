use std::fmt;
use std::str::FromStr;

/// Auxiliary grids carried in every record alongside the per-year channels.
pub const AUX_FIELDS: [&str; 3] = ["urban", "longitude", "latitude"];

const CHANNELS_LANDSAT: [&str; 8] = ["red", "green", "blue", "B4", "B5", "B6", "B7", "nl"];
const CHANNELS_MW: [&str; 10] = [
    "red", "green", "blue", "B4", "B5", "B6", "B7", "psred", "psgreen", "psblue",
];

const YEARS_FULL: [&str; 20] = [
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16",
    "17", "18", "19",
];
const YEARS_MW: [&str; 3] = ["0", "10", "15"];

/// Resolution mode of one ingest run. Fixed for the lifetime of an output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Small,
    Large,
    Mw,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("mode must be 'small', 'large', or 'mw' (got {0:?})")]
pub struct ParseModeError(String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "small" => Ok(Mode::Small),
            "large" => Ok(Mode::Large),
            "mw" => Ok(Mode::Mw),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Small => "small",
            Mode::Large => "large",
            Mode::Mw => "mw",
        })
    }
}

impl Mode {
    /// Resolves the mode into the schema descriptor used by every component.
    pub fn config(self) -> SchemaDescriptor {
        match self {
            Mode::Small => SchemaDescriptor::new(self, 54, 54, &CHANNELS_LANDSAT, &YEARS_FULL),
            Mode::Large => SchemaDescriptor::new(self, 94, 94, &CHANNELS_LANDSAT, &YEARS_FULL),
            Mode::Mw => SchemaDescriptor::new(self, 108, 108, &CHANNELS_MW, &YEARS_MW),
        }
    }
}

/// Fully-resolved per-run schema: grid size, channel order, year labels, and
/// the derived record field set. Resolved once at startup and passed by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub mode: Mode,
    pub rows: usize,
    pub cols: usize,
    pub channel_names: Vec<&'static str>,
    pub year_labels: Vec<&'static str>,
}

impl SchemaDescriptor {
    fn new(
        mode: Mode,
        rows: usize,
        cols: usize,
        channels: &[&'static str],
        years: &[&'static str],
    ) -> Self {
        Self {
            mode,
            rows,
            cols,
            channel_names: channels.to_vec(),
            year_labels: years.to_vec(),
        }
    }

    /// Elements per grid; every record field must have exactly this length.
    pub fn cells(&self) -> usize {
        self.rows * self.cols
    }

    pub fn channels(&self) -> usize {
        self.channel_names.len()
    }

    /// Elements in one assembled (rows, cols, channels) year tensor.
    pub fn tensor_len(&self) -> usize {
        self.cells() * self.channels()
    }

    /// All field names a record must carry: the channel x year cross product
    /// plus the auxiliary grids.
    pub fn field_names(&self) -> Vec<String> {
        let mut names =
            Vec::with_capacity(self.channel_names.len() * self.year_labels.len() + AUX_FIELDS.len());
        for channel in &self.channel_names {
            for year in &self.year_labels {
                names.push(format!("{channel}_{year}"));
            }
        }
        for aux in AUX_FIELDS {
            names.push(aux.to_string());
        }
        names
    }

    pub fn field_count(&self) -> usize {
        self.channel_names.len() * self.year_labels.len() + AUX_FIELDS.len()
    }

    /// Byte width of one persisted table row: the year tensors followed by
    /// lat (f32), lng (f32), sequence_id (i64), urban_share (f32).
    pub fn row_width(&self) -> usize {
        self.year_labels.len() * self.tensor_len() * 4 + 4 + 4 + 8 + 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_known_names_only() {
        assert_eq!("small".parse::<Mode>().unwrap(), Mode::Small);
        assert_eq!(" mw ".parse::<Mode>().unwrap(), Mode::Mw);
        assert!("medium".parse::<Mode>().is_err());
    }

    #[test]
    fn small_schema_shape() {
        let schema = Mode::Small.config();
        assert_eq!(schema.rows, 54);
        assert_eq!(schema.cols, 54);
        assert_eq!(schema.channels(), 8);
        assert_eq!(schema.year_labels.len(), 20);
        assert_eq!(schema.field_count(), 8 * 20 + 3);
        assert_eq!(schema.field_names().len(), schema.field_count());
    }

    #[test]
    fn mw_schema_uses_sparse_years() {
        let schema = Mode::Mw.config();
        assert_eq!(schema.rows, 108);
        assert_eq!(schema.year_labels, vec!["0", "10", "15"]);
        assert_eq!(schema.channels(), 10);
        assert_eq!(schema.field_count(), 10 * 3 + 3);
    }

    #[test]
    fn field_names_cover_aux_grids() {
        let names = Mode::Mw.config().field_names();
        for aux in AUX_FIELDS {
            assert!(names.iter().any(|n| n == aux), "missing {aux}");
        }
        assert!(names.iter().any(|n| n == "psblue_15"));
    }

    #[test]
    fn row_width_matches_layout() {
        let schema = Mode::Mw.config();
        let tensors = 3 * 108 * 108 * 10 * 4;
        assert_eq!(schema.row_width(), tensors + 4 + 4 + 8 + 4);
    }
}
