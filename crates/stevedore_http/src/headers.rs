use headers::{Header, HeaderName, HeaderValue};

/// `Content-Range: <start>-<end>` as sent with upload chunks, both ends inclusive.
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
}

static CONTENT_RANGE_NAME: HeaderName = HeaderName::from_static("content-range");

impl Header for ContentRange {
    fn name() -> &'static HeaderName {
        &CONTENT_RANGE_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        let s = s.strip_prefix("bytes ").unwrap_or(s);
        let (start, end) = s.split_once('-').ok_or_else(headers::Error::invalid)?;
        let start = start.parse().map_err(|_| headers::Error::invalid())?;
        let end = end.parse().map_err(|_| headers::Error::invalid())?;
        if end < start {
            return Err(headers::Error::invalid());
        }

        Ok(ContentRange { start, end })
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&format!("{}-{}", self.start, self.end)) {
            values.extend(std::iter::once(value));
        }
    }
}

/// `Range: 0-<last>` echoed back on upload responses; `0-0` before any byte arrived.
pub struct Range {
    pub end: u64,
}

impl Range {
    /// Range covering `length` accumulated bytes.
    pub fn accumulated(length: u64) -> Self {
        Range {
            end: length.saturating_sub(1),
        }
    }
}

static RANGE_NAME: HeaderName = HeaderName::from_static("range");

impl From<&Range> for String {
    fn from(r: &Range) -> String {
        format!("0-{}", r.end)
    }
}

impl Header for Range {
    fn name() -> &'static HeaderName {
        &RANGE_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        let end = s
            .strip_prefix("0-")
            .and_then(|end| end.parse().ok())
            .ok_or_else(headers::Error::invalid)?;
        Ok(Range { end })
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let s: String = self.into();
        if let Ok(value) = HeaderValue::from_str(&s) {
            values.extend(std::iter::once(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::plain("0-3", Some((0, 3)))]
    #[case::bytes_unit("bytes 4-7", Some((4, 7)))]
    #[case::backwards("7-4", None)]
    #[case::garbage("meow", None)]
    #[case::open("4-", None)]
    fn content_range(#[case] value: &str, #[case] expected: Option<(u64, u64)>) {
        let value = HeaderValue::from_str(value).unwrap();
        let decoded = ContentRange::decode(&mut std::iter::once(&value)).ok();
        assert_eq!(decoded.map(|r| (r.start, r.end)), expected);
    }

    #[rstest]
    #[case::empty(0, "0-0")]
    #[case::one(1, "0-0")]
    #[case::four(4, "0-3")]
    fn range_echo(#[case] length: u64, #[case] expected: &str) {
        let s: String = (&Range::accumulated(length)).into();
        assert_eq!(s, expected);
    }
}
