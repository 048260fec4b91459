mod changes;
mod client;
mod store;

pub use changes::{
    ChangeConnection, ChangeEvent, ChangeFeed, ChangeFeedError, ChangeKind, ChangeSource,
    ChangeStream,
};
pub use client::{
    ApiErrorClass, ChildrenPage, Credentials, DavClient, DavError, ItemKind, LockInfo, LockScope,
    RemoteItem,
};
pub use store::{RemoteStore, list_all_children};
