//! `mongodb://` connection-string parser.
//!
//! ```text
//! mongodb://[user[:password]@]host1[:port1][,host2[:port2]...][/[database]][?key=value&...]
//! mongodb:///tmp/mongodb-27017.sock[/database][?...]
//! mongodb://%2Ftmp%2Fmongodb-27017.sock
//! ```
//!
//! Parsing never touches the network; every malformed piece is a
//! configuration error.

use std::path::PathBuf;

use crate::error::{DriverError, Result};
use crate::options::{ClientOptions, Credential, ServerAddress};

const SCHEME: &str = "mongodb://";

/// Parse a connection string into validated [`ClientOptions`].
pub fn parse(uri: &str) -> Result<ClientOptions> {
    let rest = uri.strip_prefix(SCHEME).ok_or_else(|| {
        DriverError::config(format!("connection string must start with '{SCHEME}'"))
    })?;

    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (rest, None),
    };

    let (userinfo, rest) = match rest.rsplit_once('@') {
        Some((userinfo, rest)) => (Some(userinfo), rest),
        None => (None, rest),
    };

    let (hosts, database) = split_hosts_and_database(rest)?;

    let mut options = ClientOptions {
        hosts,
        default_database: database,
        ..ClientOptions::default()
    };

    if let Some(userinfo) = userinfo {
        options.credential = Some(parse_userinfo(userinfo, options.default_database.as_deref())?);
    }

    if let Some(query) = query {
        for pair in query.split(['&', ';']).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                DriverError::config(format!("option '{pair}' has no value"))
            })?;
            options.set(key, &decode(value)?)?;
        }
    }

    options.validate()?;
    Ok(options)
}

/// Split `host1,host2/db` (or `/path/to.sock/db`) into addresses and database.
fn split_hosts_and_database(rest: &str) -> Result<(Vec<ServerAddress>, Option<String>)> {
    if rest.starts_with('/') {
        // Unencoded absolute socket path: the path runs through ".sock".
        let end = rest.find(".sock").map(|i| i + ".sock".len()).ok_or_else(|| {
            DriverError::config(format!("unix socket path must end in '.sock': {rest}"))
        })?;
        let path = PathBuf::from(&rest[..end]);
        let database = database_from_path(&rest[end..])?;
        return Ok((vec![ServerAddress::Unix { path }], database));
    }

    let (host_list, path) = match rest.split_once('/') {
        Some((hosts, db)) => (hosts, Some(db)),
        None => (rest, None),
    };

    if host_list.is_empty() {
        return Err(DriverError::config("connection string has no hosts"));
    }

    let hosts = host_list
        .split(',')
        .map(|h| ServerAddress::parse(&decode(h)?))
        .collect::<Result<Vec<_>>>()?;

    let database = match path {
        Some(db) => database_from_path(&format!("/{db}"))?,
        None => None,
    };
    Ok((hosts, database))
}

fn database_from_path(path: &str) -> Result<Option<String>> {
    let db = match path.strip_prefix('/') {
        Some(db) => db,
        None if path.is_empty() => return Ok(None),
        None => {
            return Err(DriverError::config(format!("unexpected text after host: '{path}'")));
        }
    };
    if db.is_empty() {
        return Ok(None);
    }
    let db = decode(db)?;
    if db.contains(['/', '\\', ' ', '"', '$', '.']) {
        return Err(DriverError::config(format!("invalid database name '{db}'")));
    }
    Ok(Some(db))
}

fn parse_userinfo(userinfo: &str, database: Option<&str>) -> Result<Credential> {
    let (user, password) = match userinfo.split_once(':') {
        Some((user, password)) => (user, Some(decode(password)?)),
        None => (userinfo, None),
    };
    let username = decode(user)?;
    if username.is_empty() {
        return Err(DriverError::config("username must not be empty"));
    }
    Ok(Credential {
        username,
        password,
        source: database.map(str::to_string),
    })
}

fn decode(input: &str) -> Result<String> {
    urlencoding::decode(input)
        .map(|s| s.into_owned())
        .map_err(|e| DriverError::config(format!("invalid percent-encoding in '{input}': {e}")))
}
