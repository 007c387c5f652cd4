use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::Error;

/// Encodes `object` as MessagePack, preceded by its `name`.
pub fn encode_object<T: Serialize + ?Sized>(
	key: &str,
	name: &str,
	object: &T,
) -> Result<Vec<u8>, Error> {
	let mut buf = Vec::new();
	let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();

	name.serialize(&mut serializer)
		.and_then(|()| object.serialize(&mut serializer))
		.map_err(|source| Error::Encode {
			key: key.to_string(),
			source,
		})?;

	Ok(buf)
}

/// Decodes a blob written by [`encode_object`], checking that it was stored under `name`.
pub fn decode_object<T: DeserializeOwned>(key: &str, name: &str, blob: &[u8]) -> Result<T, Error> {
	let map_err = |source| Error::Decode {
		key: key.to_string(),
		source,
	};

	let mut deserializer = rmp_serde::Deserializer::new(blob);

	let found = String::deserialize(&mut deserializer).map_err(map_err)?;
	if found != name {
		return Err(Error::UnexpectedName {
			key: key.to_string(),
			expected: name.to_string(),
			found,
		});
	}

	T::deserialize(&mut deserializer).map_err(map_err)
}
