//! Telegram lines and the readings extracted from them.

/// First character of the line that closes a telegram.
pub const TERMINATOR: char = '!';

/// Virtual totals appended to every telegram: `(total, [tariff 1, tariff 2])`.
const AGGREGATES: [(&str, [&str; 2]); 2] = [
    ("1-0:1.8.3", ["1-0:1.8.1", "1-0:1.8.2"]),
    ("1-0:2.8.3", ["1-0:2.8.1", "1-0:2.8.2"]),
];

/// One complete batch of meter lines, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    sequence: u64,
    lines: Vec<String>,
}

impl Telegram {
    /// Starts an empty telegram numbered `sequence`.
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            lines: Vec::new(),
        }
    }

    /// Adds a line as received, without its line ending.
    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Appends one virtual total line per tariff pair and seals the telegram.
    pub fn complete(mut self) -> Self {
        for (total, tariffs) in AGGREGATES {
            let sum = tariffs
                .iter()
                .flat_map(|code| self.lines.iter().filter_map(move |l| tariff_reading(l, code)))
                .fold(0.0_f64, |acc, v| acc + v);
            self.lines.push(format!("{total}({sum:010.3}*kWh)"));
        }
        self
    }

    /// Position of this telegram since startup, counting from 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Every line that carries a `<code>(<value>)` reading.
    pub fn readings(&self) -> impl Iterator<Item = RawReading<'_>> {
        self.lines.iter().filter_map(|line| RawReading::parse(line))
    }
}

/// Matches `<code>(dddddd.ddd*kWh)` at the start of `line`.
fn tariff_reading(line: &str, code: &str) -> Option<f64> {
    let rest = line.strip_prefix(code)?.strip_prefix('(')?;
    let value = rest.get(..10)?;
    let (int, frac) = value.split_once('.')?;
    let well_formed = int.len() == 6
        && frac.len() == 3
        && int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit());
    if !well_formed || !rest[10..].starts_with("*kWh)") {
        return None;
    }
    value.parse().ok()
}

/// `<code>(<value>*<unit>)` split into its parts, still unparsed.
///
/// Lines with several groups, such as the gas reading
/// `0-1:24.2.1(231017120000S)(01234.567*m3)`, yield the last group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReading<'a> {
    pub code: &'a str,
    pub value: &'a str,
    pub unit: Option<&'a str>,
}

impl<'a> RawReading<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let open = line.find('(')?;
        let code = line[..open].trim();
        if code.is_empty() {
            return None;
        }
        let last_open = line.rfind('(')?;
        let close = last_open + line[last_open..].find(')')?;
        let group = &line[last_open + 1..close];
        let (value, unit) = match group.split_once('*') {
            Some((value, unit)) => (value, Some(unit)),
            None => (group, None),
        };
        Some(Self { code, value, unit })
    }
}

/// Decoded value of a reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    /// Parses a numeric value; `None` when it is not a decimal number.
    pub fn number(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty()
            || !raw
                .bytes()
                .all(|b| b.is_ascii_digit() || b == b'.' || b == b'-' || b == b'+')
        {
            return None;
        }
        raw.parse().ok().map(Value::Number)
    }

    pub fn text(raw: &str) -> Self {
        Value::Text(raw.to_string())
    }

    /// Payload form: numbers canonical (`000150.000` becomes `150`), text unchanged.
    pub fn to_payload(&self) -> String {
        match self {
            // -0 is published as 0
            Value::Number(n) if *n == 0.0 => "0".to_string(),
            Value::Number(n) => n.to_string(),
            Value::Text(t) => t.clone(),
        }
    }
}
