//! (De)serialize addresses as `"0x..."` strings, since that's how everybody
//! reads them in a leak dump anyway. Use with `#[serde(with = "serde_usize")]`.

use std::{fmt, marker::PhantomData};

use serde::{de::Visitor, Deserializer, Serializer};

pub trait AsUsize: Copy {
    fn as_usize(self) -> usize;
}

pub trait FromUsize: Copy {
    fn from_usize(value: usize) -> Self;
}

impl<T> AsUsize for *const T {
    fn as_usize(self) -> usize {
        self as usize
    }
}

impl<T> FromUsize for *const T {
    fn from_usize(value: usize) -> Self {
        value as Self
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsUsize,
{
    serializer.serialize_str(&format!("{:#x}", value.as_usize()))
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromUsize,
{
    struct V<Ptr>(PhantomData<Ptr>);

    impl<'de, Ptr> Visitor<'de> for V<Ptr>
    where
        Ptr: FromUsize,
    {
        type Value = Ptr;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a hex address like \"0x1f00\"")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let digits = v
                .strip_prefix("0x")
                .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(v), &self))?;
            usize::from_str_radix(digits, 16)
                .map(Ptr::from_usize)
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Ptr::from_usize(v as usize))
        }
    }

    deserializer.deserialize_any(V::<T>(PhantomData))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Wrapper {
        #[serde(with = "crate::serialize::serde_usize")]
        ptr: *const (),
    }

    #[test]
    fn addresses_are_hex_strings() {
        let w = Wrapper {
            ptr: 0x1f00 as *const (),
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"ptr":"0x1f00"}"#);
        assert_eq!(serde_json::from_str::<Wrapper>(&json).unwrap(), w);
    }

    #[test]
    fn plain_numbers_are_accepted() {
        let w: Wrapper = serde_json::from_str(r#"{"ptr":4096}"#).unwrap();
        assert_eq!(w.ptr as usize, 4096);
        assert!(serde_json::from_str::<Wrapper>(r#"{"ptr":"1f00"}"#).is_err());
    }
}
