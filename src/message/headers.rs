// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{BufMut, BytesMut};

/// Ordered header store with case-insensitive names.
///
/// Repeated names are kept as separate entries in insertion order, the
/// original spelling of each name is preserved for serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

/// A header field with a static name and a string parse/render pair.
pub trait TypedHeader: Sized {
    const NAME: &'static str;

    fn parse(raw: &str) -> Option<Self>;

    fn render(&self) -> String;
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        HeaderMap {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values under `name` joined with `", "`, the way a list-valued field
    /// would read if it had been sent as a single line.
    pub fn get_joined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn get_typed<T: TypedHeader>(&self) -> Option<T> {
        self.get_joined(T::NAME).and_then(|raw| T::parse(&raw))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Replaces every value of `name`. `None` removes the field.
    pub fn set<V: Into<String>>(&mut self, name: &str, value: Option<V>) {
        match value {
            None => {
                self.remove(name);
            }
            Some(value) => {
                let value = value.into();
                match self
                    .entries
                    .iter()
                    .position(|(n, _)| n.eq_ignore_ascii_case(name))
                {
                    Some(first) => {
                        self.entries[first].1 = value;
                        let mut index = 0;
                        self.entries.retain(|(n, _)| {
                            let keep = index <= first || !n.eq_ignore_ascii_case(name);
                            index += 1;
                            keep
                        });
                    }
                    None => self.entries.push((name.to_string(), value)),
                }
            }
        }
    }

    pub fn set_typed<T: TypedHeader>(&mut self, value: &T) {
        self.set(T::NAME, Some(value.render()));
    }

    pub fn append<V: Into<String>>(&mut self, name: &str, value: V) {
        self.entries.push((name.to_string(), value.into()));
    }

    /// Removes every value of `name`, returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes `Name: Value\r\n` lines. With `join_repeated` every name is
    /// written once, its values comma-joined at the position of the first one.
    pub fn write_to(&self, buffer: &mut BytesMut, join_repeated: bool) {
        if !join_repeated {
            for (name, value) in &self.entries {
                write_line(buffer, name, value);
            }
            return;
        }
        for (index, (name, _)) in self.entries.iter().enumerate() {
            let seen_before = self.entries[..index]
                .iter()
                .any(|(n, _)| n.eq_ignore_ascii_case(name));
            if seen_before {
                continue;
            }
            if let Some(joined) = self.get_joined(name) {
                write_line(buffer, name, &joined);
            }
        }
    }
}

fn write_line(buffer: &mut BytesMut, name: &str, value: &str) {
    buffer.reserve(name.len() + value.len() + 4);
    buffer.put_slice(name.as_bytes());
    buffer.put_slice(b": ");
    buffer.put_slice(value.as_bytes());
    buffer.put_slice(b"\r\n");
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        HeaderMap {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|token| token.trim())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLength(pub u64);

impl TypedHeader for ContentLength {
    const NAME: &'static str = "Content-Length";

    /// Repeated identical values are accepted, conflicting ones are not.
    fn parse(raw: &str) -> Option<Self> {
        let mut parsed: Option<u64> = None;
        for token in raw.split(',') {
            let token = token.trim();
            if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let value = token.parse::<u64>().ok()?;
            match parsed {
                Some(previous) if previous != value => return None,
                _ => parsed = Some(value),
            }
        }
        parsed.map(ContentLength)
    }

    fn render(&self) -> String {
        self.0.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEncoding(pub Vec<String>);

impl TransferEncoding {
    /// `chunked` must be the final coding to frame the body.
    pub fn is_chunked(&self) -> bool {
        self.0
            .last()
            .map(|coding| coding.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }
}

impl TypedHeader for TransferEncoding {
    const NAME: &'static str = "Transfer-Encoding";

    fn parse(raw: &str) -> Option<Self> {
        Some(TransferEncoding(split_tokens(raw)))
    }

    fn render(&self) -> String {
        self.0.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions(pub Vec<String>);

impl ConnectionOptions {
    pub fn has(&self, option: &str) -> bool {
        self.0.iter().any(|o| o.eq_ignore_ascii_case(option))
    }
}

impl TypedHeader for ConnectionOptions {
    const NAME: &'static str = "Connection";

    fn parse(raw: &str) -> Option<Self> {
        Some(ConnectionOptions(split_tokens(raw)))
    }

    fn render(&self) -> String {
        self.0.join(", ")
    }
}

/// Field names announced by a `Trailer` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailerFields(pub Vec<String>);

impl TypedHeader for TrailerFields {
    const NAME: &'static str = "Trailer";

    fn parse(raw: &str) -> Option<Self> {
        Some(TrailerFields(split_tokens(raw)))
    }

    fn render(&self) -> String {
        self.0.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.append("Content-Type", "text/plain");
        headers.append("Set-Cookie", "a=1");
        headers.append("X-Trace", "abc");
        headers.append("set-cookie", "b=2");
        headers
    }

    #[test]
    fn get_is_case_insensitive() {
        let headers = sample();
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(
            headers.get_all("Set-Cookie").collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );
        assert_eq!(headers.get_joined("set-cookie").as_deref(), Some("a=1, b=2"));
        assert!(headers.get("missing").is_none());
    }

    #[test]
    fn set_replaces_all_values_in_place() {
        let mut headers = sample();
        headers.set("SET-COOKIE", Some("c=3"));
        let names: Vec<(&str, &str)> = headers.iter().collect();
        assert_eq!(
            names,
            vec![
                ("Content-Type", "text/plain"),
                ("Set-Cookie", "c=3"),
                ("X-Trace", "abc"),
            ]
        );
    }

    #[test]
    fn set_none_removal_is_idempotent() {
        let mut once = sample();
        once.set::<String>("x-trace", None);

        let mut twice = sample();
        twice.set::<String>("x-trace", None);
        twice.set::<String>("x-trace", None);

        assert_eq!(once, twice);
        assert!(!twice.contains("X-Trace"));
        assert!(!twice.remove("X-Trace"));
    }

    #[test]
    fn write_repeated_as_lines_or_joined() {
        let headers = sample();

        let mut lines = BytesMut::new();
        headers.write_to(&mut lines, false);
        assert_eq!(
            &lines[..],
            b"Content-Type: text/plain\r\nSet-Cookie: a=1\r\nX-Trace: abc\r\nset-cookie: b=2\r\n"
        );

        let mut joined = BytesMut::new();
        headers.write_to(&mut joined, true);
        assert_eq!(
            &joined[..],
            b"Content-Type: text/plain\r\nSet-Cookie: a=1, b=2\r\nX-Trace: abc\r\n"
        );
    }

    #[test]
    fn typed_fields() {
        let mut headers = HeaderMap::new();
        headers.append("content-length", "42");
        headers.append("Transfer-Encoding", "gzip, Chunked");
        headers.append("Connection", "Keep-Alive");
        headers.append("Trailer", "Expires, X-Checksum");

        assert_eq!(headers.get_typed::<ContentLength>(), Some(ContentLength(42)));
        assert!(headers.get_typed::<TransferEncoding>().unwrap().is_chunked());
        assert!(headers
            .get_typed::<ConnectionOptions>()
            .unwrap()
            .has("keep-alive"));
        assert_eq!(
            headers.get_typed::<TrailerFields>().unwrap().0,
            vec!["Expires".to_string(), "X-Checksum".to_string()]
        );

        headers.set_typed(&ContentLength(7));
        assert_eq!(headers.get("Content-Length"), Some("7"));
    }

    #[test]
    fn content_length_rejects_garbage_and_conflicts() {
        assert_eq!(ContentLength::parse("10, 10"), Some(ContentLength(10)));
        assert_eq!(ContentLength::parse("10, 11"), None);
        assert_eq!(ContentLength::parse("-1"), None);
        assert_eq!(ContentLength::parse("+5"), None);
        assert_eq!(ContentLength::parse(""), None);
    }
}
