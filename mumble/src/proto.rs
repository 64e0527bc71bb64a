//! Protobuf message definitions for the subset of `Mumble.proto` (TCP control
//! channel, proto2) and `MumbleUDP.proto` (voice datagrams, proto3) the bridge
//! speaks.
//!
//! Field numbers and wire types follow the upstream `.proto` files exactly.
//! Proto2 repeated scalars are encoded unpacked, proto3 ones packed.

pub mod msgs {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Version {
        #[prost(uint32, optional, tag = "1")]
        pub version_v1: Option<u32>,
        #[prost(string, optional, tag = "2")]
        pub release: Option<String>,
        #[prost(string, optional, tag = "3")]
        pub os: Option<String>,
        #[prost(string, optional, tag = "4")]
        pub os_version: Option<String>,
        #[prost(uint64, optional, tag = "5")]
        pub version_v2: Option<u64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Authenticate {
        #[prost(string, optional, tag = "1")]
        pub username: Option<String>,
        #[prost(string, optional, tag = "2")]
        pub password: Option<String>,
        #[prost(string, repeated, tag = "3")]
        pub tokens: Vec<String>,
        #[prost(int32, repeated, packed = "false", tag = "4")]
        pub celt_versions: Vec<i32>,
        #[prost(bool, optional, tag = "5")]
        pub opus: Option<bool>,
        #[prost(int32, optional, tag = "6")]
        pub client_type: Option<i32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ping {
        #[prost(uint64, optional, tag = "1")]
        pub timestamp: Option<u64>,
        #[prost(uint32, optional, tag = "2")]
        pub good: Option<u32>,
        #[prost(uint32, optional, tag = "3")]
        pub late: Option<u32>,
        #[prost(uint32, optional, tag = "4")]
        pub lost: Option<u32>,
        #[prost(uint32, optional, tag = "5")]
        pub resync: Option<u32>,
        #[prost(uint32, optional, tag = "6")]
        pub udp_packets: Option<u32>,
        #[prost(uint32, optional, tag = "7")]
        pub tcp_packets: Option<u32>,
        #[prost(float, optional, tag = "8")]
        pub udp_ping_avg: Option<f32>,
        #[prost(float, optional, tag = "9")]
        pub udp_ping_var: Option<f32>,
        #[prost(float, optional, tag = "10")]
        pub tcp_ping_avg: Option<f32>,
        #[prost(float, optional, tag = "11")]
        pub tcp_ping_var: Option<f32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Reject {
        #[prost(enumeration = "reject::RejectType", optional, tag = "1")]
        pub r#type: Option<i32>,
        #[prost(string, optional, tag = "2")]
        pub reason: Option<String>,
    }

    pub mod reject {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum RejectType {
            None = 0,
            WrongVersion = 1,
            InvalidUsername = 2,
            WrongUserPw = 3,
            WrongServerPw = 4,
            UsernameInUse = 5,
            ServerFull = 6,
            NoCertificate = 7,
            AuthenticatorFail = 8,
            NoNewVersion = 9,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ServerSync {
        #[prost(uint32, optional, tag = "1")]
        pub session: Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub max_bandwidth: Option<u32>,
        #[prost(string, optional, tag = "3")]
        pub welcome_text: Option<String>,
        #[prost(uint64, optional, tag = "4")]
        pub permissions: Option<u64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChannelRemove {
        #[prost(uint32, required, tag = "1")]
        pub channel_id: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ChannelState {
        #[prost(uint32, optional, tag = "1")]
        pub channel_id: Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub parent: Option<u32>,
        #[prost(string, optional, tag = "3")]
        pub name: Option<String>,
        #[prost(uint32, repeated, packed = "false", tag = "4")]
        pub links: Vec<u32>,
        #[prost(string, optional, tag = "5")]
        pub description: Option<String>,
        #[prost(uint32, repeated, packed = "false", tag = "6")]
        pub links_add: Vec<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "7")]
        pub links_remove: Vec<u32>,
        #[prost(bool, optional, tag = "8")]
        pub temporary: Option<bool>,
        #[prost(int32, optional, tag = "9")]
        pub position: Option<i32>,
        #[prost(uint32, optional, tag = "11")]
        pub max_users: Option<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UserRemove {
        #[prost(uint32, required, tag = "1")]
        pub session: u32,
        #[prost(uint32, optional, tag = "2")]
        pub actor: Option<u32>,
        #[prost(string, optional, tag = "3")]
        pub reason: Option<String>,
        #[prost(bool, optional, tag = "4")]
        pub ban: Option<bool>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UserState {
        #[prost(uint32, optional, tag = "1")]
        pub session: Option<u32>,
        #[prost(uint32, optional, tag = "2")]
        pub actor: Option<u32>,
        #[prost(string, optional, tag = "3")]
        pub name: Option<String>,
        #[prost(uint32, optional, tag = "4")]
        pub user_id: Option<u32>,
        #[prost(uint32, optional, tag = "5")]
        pub channel_id: Option<u32>,
        #[prost(bool, optional, tag = "6")]
        pub mute: Option<bool>,
        #[prost(bool, optional, tag = "7")]
        pub deaf: Option<bool>,
        #[prost(bool, optional, tag = "8")]
        pub suppress: Option<bool>,
        #[prost(bool, optional, tag = "9")]
        pub self_mute: Option<bool>,
        #[prost(bool, optional, tag = "10")]
        pub self_deaf: Option<bool>,
        #[prost(string, optional, tag = "14")]
        pub comment: Option<String>,
        #[prost(string, optional, tag = "15")]
        pub hash: Option<String>,
        #[prost(uint32, repeated, packed = "false", tag = "21")]
        pub listening_channel_add: Vec<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "22")]
        pub listening_channel_remove: Vec<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TextMessage {
        #[prost(uint32, optional, tag = "1")]
        pub actor: Option<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "2")]
        pub session: Vec<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "3")]
        pub channel_id: Vec<u32>,
        #[prost(uint32, repeated, packed = "false", tag = "4")]
        pub tree_id: Vec<u32>,
        #[prost(string, required, tag = "5")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CryptSetup {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub key: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub client_nonce: Option<Vec<u8>>,
        #[prost(bytes = "vec", optional, tag = "3")]
        pub server_nonce: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VoiceTarget {
        #[prost(uint32, optional, tag = "1")]
        pub id: Option<u32>,
        #[prost(message, repeated, tag = "2")]
        pub targets: Vec<voice_target::Target>,
    }

    pub mod voice_target {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Target {
            #[prost(uint32, repeated, packed = "false", tag = "1")]
            pub session: Vec<u32>,
            #[prost(uint32, optional, tag = "2")]
            pub channel_id: Option<u32>,
            #[prost(string, optional, tag = "3")]
            pub group: Option<String>,
            #[prost(bool, optional, tag = "4")]
            pub links: Option<bool>,
            #[prost(bool, optional, tag = "5")]
            pub children: Option<bool>,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CodecVersion {
        #[prost(int32, required, tag = "1")]
        pub alpha: i32,
        #[prost(int32, required, tag = "2")]
        pub beta: i32,
        #[prost(bool, required, tag = "3")]
        pub prefer_alpha: bool,
        #[prost(bool, optional, tag = "4")]
        pub opus: Option<bool>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ServerConfig {
        #[prost(uint32, optional, tag = "1")]
        pub max_bandwidth: Option<u32>,
        #[prost(string, optional, tag = "2")]
        pub welcome_text: Option<String>,
        #[prost(bool, optional, tag = "3")]
        pub allow_html: Option<bool>,
        #[prost(uint32, optional, tag = "4")]
        pub message_length: Option<u32>,
        #[prost(uint32, optional, tag = "5")]
        pub image_message_length: Option<u32>,
        #[prost(uint32, optional, tag = "6")]
        pub max_users: Option<u32>,
    }
}

pub mod udp {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Audio {
        #[prost(oneof = "audio::Header", tags = "1, 2")]
        pub header: Option<audio::Header>,
        #[prost(uint32, tag = "3")]
        pub sender_session: u32,
        #[prost(uint64, tag = "4")]
        pub frame_number: u64,
        #[prost(bytes = "bytes", tag = "5")]
        pub opus_data: Bytes,
        #[prost(float, repeated, tag = "6")]
        pub positional_data: Vec<f32>,
        #[prost(float, tag = "7")]
        pub volume_adjustment: f32,
        #[prost(bool, tag = "16")]
        pub is_terminator: bool,
    }

    pub mod audio {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Header {
            /// Set by clients: 0 for normal talking, 1..=30 for a registered voice target.
            #[prost(uint32, tag = "1")]
            Target(u32),
            /// Set by the server: 0 normal, 1 shout, 2 whisper, 3 listen.
            #[prost(uint32, tag = "2")]
            Context(u32),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ping {
        #[prost(uint64, tag = "1")]
        pub timestamp: u64,
        #[prost(bool, tag = "2")]
        pub request_extended_information: bool,
        #[prost(uint64, tag = "3")]
        pub server_version_v2: u64,
        #[prost(uint32, tag = "4")]
        pub user_count: u32,
        #[prost(uint32, tag = "5")]
        pub max_user_count: u32,
        #[prost(uint32, tag = "6")]
        pub max_bandwidth_per_user: u32,
    }
}
