use crate::entity::{Device, Entity, Platform, State};

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

/// Case-insensitive match against the key, unique id, name, platform and register addresses.
fn is_match(entity: &dyn Entity, device: &Device, pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    if entity.key().contains(&pattern) || entity.unique_id(device).contains(&pattern) {
        return true;
    }
    if entity.name().to_lowercase().contains(&pattern) {
        return true;
    }
    if entity.platform().to_string().contains(&pattern) {
        return true;
    }
    entity
        .descriptor()
        .registers
        .iter()
        .any(|r| r.address.to_string().contains(&pattern) || r.to_string().to_lowercase() == pattern)
}

#[derive(serde::Serialize)]
struct StateRecord<'a> {
    unique_id: String,
    key: &'static str,
    platform: Platform,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a State>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Format an error along with all of its causes on one line.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut cause = error.source();
    while let Some(e) = cause {
        message.push_str(": ");
        message.push_str(&e.to_string());
        cause = e.source();
    }
    message
}

pub mod entities {
    use super::is_match;
    use crate::entity::{DeviceArgs, Descriptor, all_entities};
    use crate::output;

    /// List the entities exposed for the unit along with their registers.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        device: DeviceArgs,
        #[clap(flatten)]
        output: output::Args,
        /// The Modbus device id the unique ids are derived from.
        #[arg(long, short = 'i', default_value_t = 1)]
        device_id: u8,
        /// Only list entities matching this pattern.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct EntityRecord {
        unique_id: String,
        name: String,
        #[serde(flatten)]
        descriptor: Descriptor,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let device = args.device.device(args.device_id);
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .headers(&[
                "Platform",
                "Key",
                "Unique ID",
                "Registers",
                "Scale",
                "Unit",
                "Icon",
                "Category",
            ])
            .map_err(Error::Output)?;
        for entity in all_entities() {
            if let Some(pattern) = &args.filter {
                if !is_match(entity.as_ref(), &device, pattern) {
                    continue;
                }
            }
            let descriptor = entity.descriptor();
            let unique_id = entity.unique_id(&device);
            output
                .row(
                    || {
                        let registers = descriptor.registers.iter().map(|r| r.to_string());
                        vec![
                            entity.platform().to_string(),
                            entity.key().to_string(),
                            unique_id.clone(),
                            registers.collect::<Vec<_>>().join(", "),
                            descriptor.scale.map(|s| s.to_string()).unwrap_or_default(),
                            descriptor.traits.unit().unwrap_or_default().to_string(),
                            descriptor.icon.to_string(),
                            descriptor.category.map(|c| c.to_string()).unwrap_or_default(),
                        ]
                    },
                    || EntityRecord {
                        unique_id: unique_id.clone(),
                        name: entity.name(),
                        descriptor: descriptor.clone(),
                    },
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod read {
    use super::{StateRecord, error_chain, is_match};
    use crate::connection::{self, Connection};
    use crate::entity::{DeviceArgs, Platform, all_entities};
    use crate::output;
    use tracing::warn;

    /// Read the current state of the unit's entities.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        device: DeviceArgs,
        #[clap(flatten)]
        output: output::Args,
        /// Only read entities matching this pattern.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let Args { connection, device, output, filter } = args;
        let device = device.device(connection.device_id());
        let mut output = output.to_output().map_err(Error::Output)?;
        output.headers(&["Platform", "Key", "State"]).map_err(Error::Output)?;
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(async move {
            let connection = Connection::new(connection);
            for entity in all_entities() {
                if entity.platform() == Platform::Button {
                    continue;
                }
                if let Some(pattern) = &filter {
                    if !is_match(entity.as_ref(), &device, pattern) {
                        continue;
                    }
                }
                let (state, error) = match entity.update(&connection).await {
                    Ok(state) => (Some(state), None),
                    Err(e) => {
                        warn!(
                            message = "could not read entity",
                            key = entity.key(),
                            error = (&e as &dyn std::error::Error)
                        );
                        (None, Some(error_chain(&e)))
                    }
                };
                output
                    .row(
                        || {
                            vec![
                                entity.platform().to_string(),
                                entity.key().to_string(),
                                match (&state, &error) {
                                    (Some(state), _) => state.to_string(),
                                    (None, Some(error)) => format!("error: {error}"),
                                    (None, None) => String::new(),
                                },
                            ]
                        },
                        || StateRecord {
                            unique_id: entity.unique_id(&device),
                            key: entity.key(),
                            platform: entity.platform(),
                            state: state.as_ref(),
                            error: error.clone(),
                        },
                    )
                    .map_err(Error::Output)?;
            }
            output.commit().map_err(Error::Output)
        })
    }
}

pub mod set {
    use super::StateRecord;
    use crate::connection::{self, Connection};
    use crate::entity::{self, DeviceArgs, Entity, all_entities};
    use crate::output;
    use tracing::info;

    /// Change a setting of the unit through one of its entities.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        device: DeviceArgs,
        #[clap(flatten)]
        output: output::Args,
        /// The channel to send the value to. Defaults to the entity's first command channel.
        #[arg(long, short = 'c')]
        channel: Option<String>,
        /// Key or unique id of a writable entity.
        key: String,
        /// The value, as Home Assistant would send it (e.g. `ON`, `21.5`, `07:30`, `manual_high`).
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("there is no writable entity `{0}`")]
        UnknownEntity(String),
        #[error("`{key}` accepts commands on {accepted:?}, not `{channel}`")]
        UnknownChannel { key: &'static str, channel: String, accepted: &'static [&'static str] },
        #[error("could not apply the value")]
        Command(#[source] entity::Error),
        #[error("could not read the entity back")]
        Refresh(#[source] entity::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    /// Find the writable entity named by `key`. Keys are shared between a read-only and a
    /// writable entity in a few cases, so only entities accepting commands are considered.
    pub fn find(
        entities: Vec<Box<dyn Entity>>,
        device: &entity::Device,
        key: &str,
    ) -> Option<Box<dyn Entity>> {
        entities.into_iter().find(|e| {
            !e.command_channels().is_empty() && (e.key() == key || e.unique_id(device) == key)
        })
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let Args { connection, device, output, channel, key, value } = args;
        let device = device.device(connection.device_id());
        let entity =
            find(all_entities(), &device, &key).ok_or_else(|| Error::UnknownEntity(key.clone()))?;
        let accepted = entity.command_channels();
        let channel = match &channel {
            Some(channel) if accepted.contains(&channel.as_str()) => channel.as_str(),
            Some(channel) => {
                return Err(Error::UnknownChannel {
                    key: entity.key(),
                    channel: channel.clone(),
                    accepted,
                });
            }
            None => accepted.first().copied().unwrap_or(entity::STATE),
        };
        let mut output = output.to_output().map_err(Error::Output)?;
        output.headers(&["Platform", "Key", "State"]).map_err(Error::Output)?;
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let state = runtime.block_on(async {
            let connection = Connection::new(connection);
            info!(message = "sending", key = entity.key(), channel, value = value.as_str());
            entity.command(&connection, channel, &value).await.map_err(Error::Command)?;
            entity.update(&connection).await.map_err(Error::Refresh)
        })?;
        output
            .row(
                || vec![entity.platform().to_string(), entity.key().to_string(), state.to_string()],
                || StateRecord {
                    unique_id: entity.unique_id(&device),
                    key: entity.key(),
                    platform: entity.platform(),
                    state: Some(&state),
                    error: None,
                },
            )
            .map_err(Error::Output)?;
        output.commit().map_err(Error::Output)
    }
}

pub mod bridge {
    use crate::connection::{self, Connection};
    use crate::entity::DeviceArgs;
    use crate::hass;
    use std::sync::Arc;

    /// Expose the unit to Home Assistant through MQTT discovery.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        device: DeviceArgs,
        #[clap(flatten)]
        hass: hass::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("the Home Assistant bridge stopped")]
        Bridge(#[source] hass::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let Args { connection, device, hass } = args;
        let device = device.device(connection.device_id());
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(async move {
            let connection = Arc::new(Connection::new(connection));
            hass::run(hass, device, connection).await.map_err(Error::Bridge)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Model, all_entities};

    fn device() -> Device {
        Device { model: Model::Vsr300, slave: 1 }
    }

    fn matching(pattern: &str) -> Vec<&'static str> {
        all_entities()
            .iter()
            .filter(|e| is_match(e.as_ref(), &device(), pattern))
            .map(|e| e.key())
            .collect()
    }

    #[test]
    fn filters_by_key_register_and_platform() {
        assert!(matching("ECO_MODE").contains(&"eco_mode"));
        assert!(matching("h2504").contains(&"eco_mode"));
        assert_eq!(matching("climate"), ["climate"]);
        assert_eq!(matching("button").len(), 9);
    }

    #[test]
    fn set_prefers_writable_entities() {
        let entity = set::find(all_entities(), &device(), "free_cooling").unwrap();
        assert_eq!(entity.platform(), Platform::Switch);
        assert!(set::find(all_entities(), &device(), "systemair_1_climate").is_some());
        assert!(set::find(all_entities(), &device(), "supply_temp").is_none());
    }

    #[test]
    fn error_chains_are_flattened() {
        let error = set::Error::UnknownEntity("x".into());
        assert_eq!(error_chain(&error), "there is no writable entity `x`");
    }
}
