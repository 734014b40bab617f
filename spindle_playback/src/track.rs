//! The track model and the provider's playback-state payload

use serde::{Deserialize, Serialize};

/// A track that is currently playing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// The track title
    pub name: String,
    /// Names of the performing artists, in billing order
    pub artists: Vec<String>,
    /// The album title
    pub album: String,
    /// The largest available album artwork
    pub artwork_url: Option<String>,
    /// The length of the track in milliseconds
    pub duration_ms: u64,
    /// How far into the track playback is, in milliseconds
    pub progress_ms: Option<u64>,
    /// A link to the track on the provider's site
    pub external_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlaybackState {
    #[serde(default)]
    is_playing: bool,
    progress_ms: Option<u64>,
    item: Option<PlaybackItem>,
}

#[derive(Debug, Deserialize)]
struct PlaybackItem {
    name: String,
    #[serde(default)]
    artists: Vec<Artist>,
    album: Option<Album>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    external_urls: ExternalUrls,
}

#[derive(Debug, Deserialize)]
struct Artist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Album {
    name: String,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct Image {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

impl PlaybackState {
    /// The track being played, if playback is active
    ///
    /// Paused playback is reported the same as no playback at all.
    pub(crate) fn into_playing_track(self) -> Option<Track> {
        if !self.is_playing {
            return None;
        }

        let item = self.item?;
        let (album, artwork_url) = match item.album {
            Some(album) => (album.name, album.images.into_iter().next().map(|i| i.url)),
            None => (String::new(), None),
        };

        Some(Track {
            name: item.name,
            artists: item.artists.into_iter().map(|a| a.name).collect(),
            album,
            artwork_url,
            duration_ms: item.duration_ms,
            progress_ms: self.progress_ms,
            external_url: item.external_urls.spotify,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYING: &str = r#"{
        "timestamp": 1700000000000,
        "progress_ms": 42000,
        "is_playing": true,
        "currently_playing_type": "track",
        "item": {
            "name": "Windowlicker",
            "duration_ms": 367000,
            "artists": [{ "name": "Aphex Twin", "id": "6kBDZFXuLrZgHnvmPu9NsG" }],
            "album": {
                "name": "Windowlicker",
                "images": [
                    { "url": "https://i.scdn.co/image/large", "height": 640, "width": 640 },
                    { "url": "https://i.scdn.co/image/small", "height": 64, "width": 64 }
                ]
            },
            "external_urls": { "spotify": "https://open.spotify.com/track/1" }
        }
    }"#;

    fn parse(body: &str) -> PlaybackState {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn playing_track_is_normalized() {
        let track = parse(PLAYING).into_playing_track().unwrap();

        assert_eq!(
            track,
            Track {
                name: "Windowlicker".into(),
                artists: vec!["Aphex Twin".into()],
                album: "Windowlicker".into(),
                artwork_url: Some("https://i.scdn.co/image/large".into()),
                duration_ms: 367000,
                progress_ms: Some(42000),
                external_url: Some("https://open.spotify.com/track/1".into()),
            }
        );
    }

    #[test]
    fn paused_playback_has_no_track() {
        let paused = PLAYING.replace(r#""is_playing": true"#, r#""is_playing": false"#);

        assert_eq!(parse(&paused).into_playing_track(), None);
    }

    #[test]
    fn playback_without_item_has_no_track() {
        let state = parse(r#"{"is_playing": true, "progress_ms": 0, "item": null}"#);

        assert_eq!(state.into_playing_track(), None);
    }

    #[test]
    fn episode_without_album_or_artists_is_still_a_track() {
        let state = parse(
            r#"{"is_playing": true, "item": {"name": "Episode 12", "duration_ms": 1800000}}"#,
        );

        let track = state.into_playing_track().unwrap();
        assert_eq!(track.name, "Episode 12");
        assert!(track.artists.is_empty());
        assert_eq!(track.album, "");
        assert_eq!(track.artwork_url, None);
        assert_eq!(track.progress_ms, None);
    }
}
