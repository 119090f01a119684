// Copyright 2024 Google LLC
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

use std::fmt;
use std::fmt::Display;

use anyhow::Context;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

// https://stackoverflow.com/questions/38088067/equivalent-of-func-or-function-in-rust
#[macro_export]
macro_rules! fname {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        type_name_of(f).strip_suffix("::f").unwrap()
    }};
}
pub use fname;

pub struct Location {
    pub fname: &'static str,
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} at {}:{}", self.fname, self.file, self.line)
    }
}

#[macro_export]
macro_rules! loc {
    () => {
        $crate::error::Location {
            fname: $crate::fname!(),
            file: file!(),
            line: line!(),
        }
    };
}
pub use loc;

pub trait LocationContextExt<T, E>: Context<T, E> {
    fn with_context<C, F>(self, loc: Location, context: F) -> anyhow::Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;

    fn context(self, loc: Location, context: impl Display + Send + Sync + 'static)
    -> anyhow::Result<T>;

    fn location(self, loc: Location) -> anyhow::Result<T>;
}

impl<R, T, E> LocationContextExt<T, E> for R
where
    R: Context<T, E>,
{
    fn with_context<C, F>(self, loc: Location, context: F) -> anyhow::Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        Context::with_context(self, || format!("{}: {}", loc, context()))
    }

    fn context(
        self,
        loc: Location,
        context: impl Display + Send + Sync + 'static,
    ) -> anyhow::Result<T> {
        LocationContextExt::with_context(self, loc, || context)
    }

    fn location(self, loc: Location) -> anyhow::Result<T> {
        Context::with_context(self, || loc)
    }
}

/// Log a `Result` and then return it, e.g. `foo.try_into().log(loc!()).ok()`.
pub trait LogExt<T, E>: Context<T, E> {
    fn trace(self, loc: Location) -> anyhow::Result<T>;
    fn debug(self, loc: Location) -> anyhow::Result<T>;
    fn info(self, loc: Location) -> anyhow::Result<T>;
    fn warn(self, loc: Location) -> anyhow::Result<T>;
    fn error(self, loc: Location) -> anyhow::Result<T>;
    fn log(self, loc: Location) -> anyhow::Result<T>;
}

impl<R, T, E> LogExt<T, E> for R
where
    R: Context<T, E>,
{
    fn trace(self, loc: Location) -> anyhow::Result<T> {
        let res = self.location(loc);
        if let Err(e) = &res {
            trace!("{e:?}");
        }
        res
    }

    fn debug(self, loc: Location) -> anyhow::Result<T> {
        let res = self.location(loc);
        if let Err(e) = &res {
            debug!("{e:?}");
        }
        res
    }

    fn info(self, loc: Location) -> anyhow::Result<T> {
        let res = self.location(loc);
        if let Err(e) = &res {
            info!("{e:?}");
        }
        res
    }

    fn warn(self, loc: Location) -> anyhow::Result<T> {
        let res = self.location(loc);
        if let Err(e) = &res {
            warn!("{e:?}");
        }
        res
    }

    fn error(self, loc: Location) -> anyhow::Result<T> {
        let res = self.location(loc);
        if let Err(e) = &res {
            error!("{e:?}");
        }
        res
    }

    fn log(self, loc: Location) -> anyhow::Result<T> {
        self.error(loc)
    }
}

/// Useful when implementing a foreign trait / a callback that can't return a
/// `Result` and isn't worth panicking over.
pub trait LogAndIgnoreExt<T, E>: LogExt<T, E> {
    fn trace_and_ignore(self, loc: Location);
    fn debug_and_ignore(self, loc: Location);
    fn info_and_ignore(self, loc: Location);
    fn warn_and_ignore(self, loc: Location);
    fn error_and_ignore(self, loc: Location);
    fn log_and_ignore(self, loc: Location);
}

impl<R, T, E> LogAndIgnoreExt<T, E> for R
where
    R: Context<T, E>,
{
    fn trace_and_ignore(self, loc: Location) {
        _ = self.trace(loc);
    }

    fn debug_and_ignore(self, loc: Location) {
        _ = self.debug(loc);
    }

    fn info_and_ignore(self, loc: Location) {
        _ = self.info(loc);
    }

    fn warn_and_ignore(self, loc: Location) {
        _ = self.warn(loc);
    }

    fn error_and_ignore(self, loc: Location) {
        _ = self.error(loc);
    }

    fn log_and_ignore(self, loc: Location) {
        _ = self.log(loc);
    }
}
