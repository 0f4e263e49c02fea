//! Built-in host functions under the `scriptwire` import module.
//!
//! | name                | signature | behavior                                   |
//! |---------------------|-----------|--------------------------------------------|
//! | `callable_call`     | `lcl`     | call a callable with a packed list         |
//! | `json_encode`       | `slb`     | packed list to JSON text, optionally pretty|
//! | `json_decode`       | `ls`      | JSON text to packed list                   |
//! | `get_resource_name` | `se`      | name of a resource handle                  |
//! | `get_this_resource` | `e`       | handle of the calling resource             |
//! | `is_entity`         | `be`      | whether a handle is a live entity          |

use tracing::debug;

use super::args::ArgStream;
use super::sandbox::{SandboxBuilder, SandboxError, SANDBOX_MODULE};
use crate::codec::TextCodec;
use crate::config::TextOptions;
use crate::value::{ForeignHandle, ValueList};

pub fn register(builder: &mut SandboxBuilder) -> Result<(), SandboxError> {
    builder
        .interface(SANDBOX_MODULE)
        .func("callable_call", "lcl", |args| {
            let callable = args.try_read_callable();
            let list = args.read_value_list();
            let callable = match callable {
                Ok(callable) => callable,
                Err(e) => return args.ret(ValueList::new(), Some(&e.to_string())),
            };
            let Some(directory) = args.context().directory.upgrade() else {
                return args.ret(ValueList::new(), Some("directory dropped"));
            };
            match callable.call(&*directory, &list) {
                Ok(results) => args.ret(results, None),
                Err(e) => args.ret(ValueList::new(), Some(&e.to_string())),
            }
        })?
        .func("json_encode", "slb", |args| {
            let list = args.read_value_list();
            let pretty = args.read_bool(false);
            let Some(directory) = args.context().directory.upgrade() else {
                return args.ret("", None);
            };
            let options = TextOptions {
                serialize: false,
                pretty,
            };
            let codec = TextCodec::new(&*directory, options).with_limits(args.context().limits);
            match codec.encode_string(&list) {
                Ok((text, _)) => args.ret(text, None),
                Err(e) => args.ret("", Some(&e.to_string())),
            }
        })?
        .func("json_decode", "ls", |args| {
            let text = args.read_string("");
            let Some(directory) = args.context().directory.upgrade() else {
                return args.ret(ValueList::new(), None);
            };
            let codec = TextCodec::new(&*directory, TextOptions::default())
                .with_limits(args.context().limits);
            match codec.decode_str(&text) {
                Ok((list, _)) => args.ret(list, None),
                Err(e) => {
                    debug!(error = %e, "json_decode rejected document");
                    args.ret(ValueList::new(), None)
                }
            }
        })?
        .func("get_resource_name", "se", |args| {
            let name = match args.read_handle() {
                Some(ForeignHandle::Resource(id)) => args
                    .context()
                    .directory
                    .upgrade()
                    .and_then(|directory| directory.resource_name(id)),
                _ => None,
            };
            args.ret(name.unwrap_or_default(), None)
        })?
        .func("get_this_resource", "e", |args| {
            let resource = args.context().resource;
            args.ret(Some(ForeignHandle::Resource(resource)), None)
        })?
        .func("is_entity", "be", |args| {
            let handle = args.read_handle();
            args.ret(matches!(handle, Some(ForeignHandle::Entity(_))), None)
        })?;
    Ok(())
}
