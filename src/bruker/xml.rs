use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};
use std::ops::ControlFlow;
use std::path::Path;

use crate::error::{ConversionError, Result};

/// One element boundary seen by the streaming reader. Empty elements are
/// reported as an `Open` immediately followed by a `Close`.
pub enum XmlNode<'a> {
    Open(&'a BytesStart<'a>),
    Close(&'a [u8]),
}

/// Walk the document forward-only, handing every element boundary to
/// `visit` until it breaks or the document ends.
pub fn stream_elements<F>(path: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(XmlNode<'_>) -> Result<ControlFlow<()>>,
{
    let mut reader = Reader::from_file(path)?;
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    loop {
        let flow = match reader.read_event_into(&mut buf)? {
            Event::Start(e) => visit(XmlNode::Open(&e))?,
            Event::Empty(e) => match visit(XmlNode::Open(&e))? {
                ControlFlow::Break(()) => ControlFlow::Break(()),
                ControlFlow::Continue(()) => visit(XmlNode::Close(e.name().as_ref()))?,
            },
            Event::End(e) => visit(XmlNode::Close(e.name().as_ref()))?,
            Event::Eof => break,
            _ => ControlFlow::Continue(()),
        };

        if flow.is_break() {
            break;
        }
        buf.clear();
    }

    Ok(())
}

/// Read a single attribute value, unescaped
pub fn attribute(element: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Parse the calendar date of a `PVScan/@date` value
/// (`MM/DD/YYYY hh:mm:ss AM/PM`). Only the date part is kept.
pub fn parse_scan_date(value: &str) -> Result<NaiveDate> {
    let invalid = || ConversionError::InvalidTimestamp {
        what: "PVScan date",
        value: value.to_string(),
    };
    let date_token = value.split_whitespace().next().ok_or_else(invalid)?;
    NaiveDate::parse_from_str(date_token, "%m/%d/%Y").map_err(|_| invalid())
}

/// Parse the time of day of a free-form `Sequence/@time` value
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    let trimmed = value.trim();

    for format in ["%H:%M:%S%.f", "%I:%M:%S%.f %p", "%I:%M:%S %p", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(trimmed, format) {
            return Ok(time);
        }
    }

    if let Ok(date_time) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(date_time.time());
    }

    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%m/%d/%Y %I:%M:%S %p",
        "%m/%d/%Y %H:%M:%S",
    ] {
        if let Ok(date_time) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(date_time.time());
        }
    }

    Err(ConversionError::InvalidTimestamp {
        what: "Sequence time",
        value: value.to_string(),
    })
}

/// Date of the first `PVScan` combined with the time of day of the first `Sequence`
#[derive(Debug, Default)]
pub struct SessionStartCollector {
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
}

impl SessionStartCollector {
    pub fn visit(&mut self, node: &XmlNode<'_>) -> Result<ControlFlow<()>> {
        if let XmlNode::Open(element) = node {
            match element.name().as_ref() {
                b"PVScan" if self.date.is_none() => {
                    if let Some(value) = attribute(element, "date")? {
                        self.date = Some(parse_scan_date(&value)?);
                    }
                }
                b"Sequence" if self.time.is_none() => {
                    if let Some(value) = attribute(element, "time")? {
                        self.time = Some(parse_time_of_day(&value)?);
                    }
                }
                _ => {}
            }
        }

        if self.date.is_some() && self.time.is_some() {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    }

    pub fn finish(self, path: &Path) -> Result<NaiveDateTime> {
        let date = self.date.ok_or_else(|| ConversionError::MissingTimestamp {
            path: path.to_path_buf(),
            element: "PVScan",
            attribute: "date",
        })?;
        let time = self.time.ok_or_else(|| ConversionError::MissingTimestamp {
            path: path.to_path_buf(),
            element: "Sequence",
            attribute: "time",
        })?;
        Ok(date.and_time(time))
    }
}

/// `(channel, channelName)` pairs of the `File` records inside the first `Frame`
#[derive(Debug, Default)]
pub struct FirstFrameChannels {
    pub channels: Vec<(String, String)>,
    done: bool,
}

impl FirstFrameChannels {
    pub fn visit(&mut self, node: &XmlNode<'_>) -> Result<ControlFlow<()>> {
        if self.done {
            return Ok(ControlFlow::Break(()));
        }

        match node {
            XmlNode::Open(element) if element.name().as_ref() == b"File" => {
                let channel = attribute(element, "channel")?;
                let channel_name = attribute(element, "channelName")?;
                if let (Some(channel), Some(channel_name)) = (channel, channel_name) {
                    self.channels.push((channel, channel_name));
                }
            }
            XmlNode::Close(name) if *name == b"Frame" => {
                self.done = true;
                return Ok(ControlFlow::Break(()));
            }
            _ => {}
        }

        Ok(ControlFlow::Continue(()))
    }
}

/// Every `Frame/@absoluteTime` in document order
#[derive(Debug, Default)]
pub struct FrameTimes {
    pub times: Vec<f64>,
}

impl FrameTimes {
    pub fn visit(&mut self, node: &XmlNode<'_>) -> Result<ControlFlow<()>> {
        if let XmlNode::Open(element) = node
            && element.name().as_ref() == b"Frame"
        {
            let value = attribute(element, "absoluteTime")?.ok_or_else(|| {
                ConversionError::InvalidTimestamp {
                    what: "Frame absoluteTime",
                    value: String::new(),
                }
            })?;
            let time = value
                .trim()
                .parse::<f64>()
                .map_err(|_| ConversionError::InvalidTimestamp {
                    what: "Frame absoluteTime",
                    value: value.clone(),
                })?;
            self.times.push(time);
        }
        Ok(ControlFlow::Continue(()))
    }
}

/// Flattens the root `PVScan` attributes and every `PVStateValue` into one
/// map. The first occurrence of a key wins, also for nested entries.
#[derive(Debug, Default)]
pub struct StateValueCollector {
    pub values: Map<String, Value>,
    root_seen: bool,
    // Key of the open PVStateValue that holds nested values, and whether
    // this occurrence is the one being recorded.
    open_key: Option<(String, bool)>,
    // `index` attributes of open containers below the PVStateValue
    index_stack: Vec<Option<String>>,
}

impl StateValueCollector {
    pub fn visit(&mut self, node: &XmlNode<'_>) -> Result<ControlFlow<()>> {
        match node {
            XmlNode::Open(element) => self.open(element)?,
            XmlNode::Close(name) => {
                if *name == b"PVStateValue" {
                    self.open_key = None;
                    self.index_stack.clear();
                } else if self.open_key.is_some() {
                    self.index_stack.pop();
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn open(&mut self, element: &BytesStart<'_>) -> Result<()> {
        let name = element.name();

        if name.as_ref() == b"PVScan" && !self.root_seen {
            self.root_seen = true;
            for attr in element.attributes() {
                let attr = attr?;
                let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                let value = attr.unescape_value()?.into_owned();
                self.values.entry(key).or_insert(Value::String(value));
            }
            return Ok(());
        }

        if name.as_ref() == b"PVStateValue" {
            let Some(key) = attribute(element, "key")? else {
                return Ok(());
            };

            if let Some(value) = attribute(element, "value")? {
                self.values.entry(key).or_insert(Value::String(value));
                self.open_key = None;
            } else {
                let recording = !self.values.contains_key(&key);
                if recording {
                    self.values.insert(key.clone(), Value::Object(Map::new()));
                }
                self.open_key = Some((key, recording));
            }
            self.index_stack.clear();
            return Ok(());
        }

        let Some((key, recording)) = &self.open_key else {
            return Ok(());
        };

        let index = attribute(element, "index")?;
        if *recording && let Some(value) = attribute(element, "value")? {
            let sub_key = match attribute(element, "description")? {
                Some(description) => Some(description),
                None => self
                    .index_stack
                    .iter()
                    .rev()
                    .find_map(|parent| parent.clone())
                    .or_else(|| index.clone()),
            };

            if let Some(sub_key) = sub_key
                && let Some(Value::Object(entries)) = self.values.get_mut(key)
            {
                entries.entry(sub_key).or_insert(Value::String(value));
            }
        }

        self.index_stack.push(index);
        Ok(())
    }
}
