use std::{error::Error, fmt, iter};

use snafu::{Location, Snafu};

use crate::color::Color;

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn Error>, Some)))]
    source: Option<Box<dyn Error>>,
}

fn location_of<'e>(error: &'e (dyn Error + 'static)) -> Option<&'e Location> {
    error
        .downcast_ref::<GenericError>()
        .map(|error| &error.location)
}

/// Renders an error together with its chain of causes.
///
/// ```text
/// Error: failed to replay trace, path=foo.trace
///   at <file>:<line>:<column>
///
/// Caused by:
///    0: replay aborted
///       at <file>:<line>:<column>
///    1: line 3: `a` is not allocated
/// ```
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_entry(f, "Error: ", "  ", &self.error)?;

        let mut causes =
            iter::successors(self.error.source(), |&cause| cause.source()).peekable();
        if causes.peek().is_some() {
            writeln!(f, "\nCaused by:")?;
        }
        for (index, cause) in causes.enumerate() {
            write_entry(f, &format!("{index:4}: "), "      ", cause)?;
        }
        Ok(())
    }
}

fn write_entry(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    indent: &str,
    error: &(dyn Error + 'static),
) -> fmt::Result {
    writeln!(f, "{label}{}", Color::Red.paint(error))?;
    if let Some(loc) = location_of(error) {
        writeln!(f, "{indent}at {}", Color::DarkGray.paint(loc))?;
    }
    Ok(())
}
