//! Binary persistence of the packed automaton.
//!
//! Layout: a property table (count byte, then a name and a tagged scalar
//! per entry), the integer arrays `l`, `base`, `check`, `fail`, the jagged
//! `output` table, and, when the stream says so, the value block.
//! Properties this version does not recognise are stepped over by their
//! tag, so streams written by a newer build still load.

use std::{
    cmp,
    io::{Read, Write},
};

use kasane_wire as wire;
use snafu::{ensure, ResultExt};
use tracing::{instrument, trace};
use wire::WireValue;

use crate::{CorruptError, Matcher, Result, WireError};

const PROP_SAVE_VALUES: &str = "saveValues";
const PROP_SIZE: &str = "size";
const PROP_IGNORE_CASE: &str = "ignoreCase";

impl<V> Matcher<V> {
    /// Persist the matcher together with its value table.
    ///
    /// A matcher that holds no values (loaded structure-only) falls back
    /// to writing a values-less stream.
    #[instrument(skip_all, level = "trace")]
    pub fn save<W: Write>(&self, w: &mut W) -> Result<()>
    where
        V: WireValue,
    {
        let values = match self.values.as_deref() {
            Some(values) => values,
            None => return self.write_structure(w, false),
        };
        self.write_structure(w, true)?;
        wire::write_varint_i32(w, values.len() as i32).context(WireError)?;
        for value in values {
            wire::write_value(w, value).context(WireError)?;
        }
        Ok(())
    }

    /// Persist only the automaton. The value table must be rebuilt on load
    /// through [`Matcher::load_with`], or left absent.
    pub fn save_without_values<W: Write>(&self, w: &mut W) -> Result<()> {
        self.write_structure(w, false)
    }

    /// Load a matcher, values included when the stream carries them.
    #[instrument(skip_all, level = "trace")]
    pub fn load<R: Read>(r: &mut R) -> Result<Matcher<V>>
    where
        V: WireValue,
    {
        let (mut matcher, has_values) = Self::load_structure(r)?;
        if has_values {
            let count = wire::read_varint_i32(r).context(WireError)?;
            ensure!(
                count as usize == matcher.key_lengths.len(),
                CorruptError {
                    detail: format!(
                        "{} values for {} keywords",
                        count,
                        matcher.key_lengths.len()
                    )
                }
            );
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                values.push(wire::read_value(r).context(WireError)?);
            }
            matcher.values = Some(values);
        }
        Ok(matcher)
    }

    /// Load the automaton and rebuild the value table through `value_of`,
    /// called once per keyword index. A value block in the stream is
    /// stepped over by tag without being decoded.
    pub fn load_with<R: Read, F>(r: &mut R, value_of: F) -> Result<Matcher<V>>
    where
        F: FnMut(usize) -> V,
    {
        let (mut matcher, has_values) = Self::load_structure(r)?;
        if has_values {
            let count = wire::read_varint_i32(r).context(WireError)?;
            ensure!(
                count >= 0,
                CorruptError {
                    detail: format!("value count {count}")
                }
            );
            for _ in 0..count {
                wire::skip_value(r).context(WireError)?;
            }
        }
        matcher.values = Some((0..matcher.key_lengths.len()).map(value_of).collect());
        Ok(matcher)
    }

    fn write_structure<W: Write>(&self, w: &mut W, save_values: bool) -> Result<()> {
        wire::write_u8(w, 3).context(WireError)?;
        wire::write_str(w, PROP_SAVE_VALUES).context(WireError)?;
        wire::write_value(w, &save_values).context(WireError)?;
        wire::write_str(w, PROP_SIZE).context(WireError)?;
        wire::write_value(w, &(self.size as i32)).context(WireError)?;
        wire::write_str(w, PROP_IGNORE_CASE).context(WireError)?;
        wire::write_value(w, &self.ignore_case).context(WireError)?;

        wire::write_int_array(w, Some(&self.key_lengths)).context(WireError)?;
        wire::write_int_array(w, Some(&self.base)).context(WireError)?;
        wire::write_int_array(w, Some(&self.check)).context(WireError)?;
        wire::write_int_array(w, Some(&self.fail)).context(WireError)?;

        wire::write_varint_i32(w, self.output.len() as i32).context(WireError)?;
        for entry in &self.output {
            wire::write_int_array(w, entry.as_deref()).context(WireError)?;
        }
        Ok(())
    }

    fn load_structure<R: Read>(r: &mut R) -> Result<(Matcher<V>, bool)> {
        // defaults cover streams written before a property existed
        let mut save_values = true;
        let mut ignore_case = false;
        let mut size: i32 = 0;

        let prop_count = wire::read_u8(r).context(WireError)?;
        for _ in 0..prop_count {
            let name = wire::read_str(r).context(WireError)?;
            match name.as_str() {
                PROP_SAVE_VALUES => {
                    save_values = wire::read_value(r).context(WireError)?;
                }
                PROP_IGNORE_CASE => {
                    ignore_case = wire::read_value(r).context(WireError)?;
                }
                PROP_SIZE => {
                    size = wire::read_value(r).context(WireError)?;
                }
                _ => wire::skip_value(r).context(WireError)?,
            }
        }
        ensure!(
            size >= 0,
            CorruptError {
                detail: format!("negative size {size}")
            }
        );
        let size = size as usize;

        let key_lengths = required_array(r, "l")?;
        let base = required_array(r, "base")?;
        let check = required_array(r, "check")?;
        let fail = required_array(r, "fail")?;

        let outer = wire::read_varint_i32(r).context(WireError)?;
        ensure!(
            outer >= 0,
            CorruptError {
                detail: format!("output table length {outer}")
            }
        );
        let mut output = Vec::with_capacity((outer as usize).min(1 << 16));
        for _ in 0..outer {
            output.push(
                wire::read_int_array(r)
                    .context(WireError)?
                    .map(Vec::into_boxed_slice),
            );
        }

        ensure!(
            base.len() >= size && fail.len() >= size && output.len() >= size,
            CorruptError {
                detail: String::from("arrays shorter than the declared size")
            }
        );
        ensure!(
            base.len() == check.len(),
            CorruptError {
                detail: String::from("base and check disagree on length")
            }
        );
        ensure!(
            fail.iter()
                .all(|&f| f >= 0 && (f as usize) < cmp::max(size, 1)),
            CorruptError {
                detail: String::from("failure link out of range")
            }
        );
        ensure!(
            key_lengths.iter().all(|&len| len >= 0),
            CorruptError {
                detail: String::from("negative keyword length")
            }
        );
        let keys = key_lengths.len() as i32;
        ensure!(
            output
                .iter()
                .flatten()
                .flat_map(|entry| entry.iter())
                .all(|&index| index >= 0 && index < keys),
            CorruptError {
                detail: String::from("output index out of range")
            }
        );

        trace!("loaded {} keywords over {} slots", key_lengths.len(), size);
        Ok((
            Matcher {
                base,
                check,
                fail,
                output,
                key_lengths,
                values: None,
                size,
                ignore_case,
            },
            save_values,
        ))
    }
}

fn required_array<R: Read>(r: &mut R, name: &str) -> Result<Vec<i32>> {
    match wire::read_int_array(r).context(WireError)? {
        Some(values) => Ok(values),
        None => CorruptError {
            detail: format!("array {name} is absent"),
        }
        .fail(),
    }
}
